use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;

use super::{effective_speed, SpeechBackend, SynthesisRequest};
use crate::error::Result;
use crate::format::SourceFormat;
use crate::process::{run_filter, CommandSpec};
use crate::session::SynthesisContext;
use crate::{into_audio_stream, AudioByteStream};

const BASE_WPM: f32 = 175.0;

/// Formant synthesizer used as the last resort: robotic, but it speaks
/// nearly every language and has no model files to go missing.
#[derive(Debug, Clone)]
pub struct EspeakBackend {
    name: String,
    program: String,
    voice: Option<String>,
    words_per_minute: Option<u32>,
}

impl EspeakBackend {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            voice: None,
            words_per_minute: None,
        }
    }

    /// Fixed voice; otherwise the sentence language is passed to `-v`.
    pub fn with_voice(mut self, voice: Option<String>) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_words_per_minute(mut self, wpm: Option<u32>) -> Self {
        self.words_per_minute = wpm;
        self
    }

    fn command(&self, request: &SynthesisRequest) -> CommandSpec {
        let voice = self.voice.clone().unwrap_or_else(|| request.language.clone());
        let wpm = match self.words_per_minute {
            Some(wpm) if request.voice.speed.is_none() => wpm,
            _ => (BASE_WPM * effective_speed(request, None)).round() as u32,
        };
        let wpm = wpm.to_string();
        CommandSpec::new(
            self.program.clone(),
            ["--stdout", "--stdin", "-v", voice.as_str(), "-s", wpm.as_str()],
        )
    }
}

#[async_trait]
impl SpeechBackend for EspeakBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_format(&self) -> SourceFormat {
        SourceFormat::Wav
    }

    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        ctx: &SynthesisContext,
    ) -> Result<AudioByteStream> {
        let text: Result<Bytes> = Ok(Bytes::from(request.text.clone()));
        let input = into_audio_stream(stream::iter([text]));
        Ok(run_filter(self.command(request), input, ctx.clone()))
    }
}
