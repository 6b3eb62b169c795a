use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use tracing::{debug, warn};

use super::{effective_speed, SpeechBackend, SynthesisRequest};
use crate::error::{Result, TtsError};
use crate::format::SourceFormat;
use crate::process::{run_filter, CommandSpec};
use crate::session::SynthesisContext;
use crate::{into_audio_stream, AudioByteStream};

const DEFAULT_SAMPLE_RATE: u32 = 22050;
const NOISE_SCALE: &str = "0.667";
const NOISE_W: &str = "0.8";

/// Local neural voice: the `piper` binary reading text on stdin and writing
/// raw mono PCM on stdout.
#[derive(Debug, Clone)]
pub struct PiperBackend {
    name: String,
    program: String,
    model: PathBuf,
    speaker: Option<i64>,
    speed: Option<f32>,
    sample_rate: u32,
}

impl PiperBackend {
    /// Builds a backend for `model`, taking the sample rate from the model's
    /// `.onnx.json` sidecar unless one is given.
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        model: impl Into<PathBuf>,
        sample_rate: Option<u32>,
    ) -> Self {
        let model = model.into();
        let sample_rate = sample_rate.unwrap_or_else(|| {
            Self::read_sample_rate(sidecar(&model)).unwrap_or_else(|e| {
                debug!(model = %model.display(), error = %e, "using default piper sample rate");
                DEFAULT_SAMPLE_RATE
            })
        });
        Self {
            name: name.into(),
            program: program.into(),
            model,
            speaker: None,
            speed: None,
            sample_rate,
        }
    }

    pub fn with_speaker(mut self, speaker: Option<i64>) -> Self {
        self.speaker = speaker;
        self
    }

    pub fn with_speed(mut self, speed: Option<f32>) -> Self {
        self.speed = speed;
        self
    }

    pub fn model(&self) -> &Path {
        &self.model
    }

    fn read_sample_rate<P: AsRef<Path>>(cfg_path: P) -> anyhow::Result<u32> {
        let cfg_path = cfg_path.as_ref();
        let data = std::fs::read_to_string(cfg_path)
            .with_context(|| format!("reading {}", cfg_path.display()))?;
        let json: serde_json::Value = serde_json::from_str(&data)?;
        let sample_rate = json
            .get("audio")
            .and_then(|a| a.get("sample_rate"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow::anyhow!("Missing or invalid 'audio.sample_rate' in config"))?;
        Ok(sample_rate as u32)
    }

    fn command(&self, request: &SynthesisRequest) -> CommandSpec {
        let length_scale = 1.0 / effective_speed(request, self.speed);
        let mut args = vec![
            "--model".to_string(),
            self.model.display().to_string(),
            "--output-raw".to_string(),
            "--length_scale".to_string(),
            format!("{length_scale:.3}"),
            "--noise_scale".to_string(),
            NOISE_SCALE.to_string(),
            "--noise_w".to_string(),
            NOISE_W.to_string(),
        ];
        if let Some(speaker) = request.voice.speaker.or(self.speaker) {
            args.push("--speaker".to_string());
            args.push(speaker.to_string());
        }
        CommandSpec::new(self.program.clone(), args)
    }
}

fn sidecar(model: &Path) -> PathBuf {
    let mut path = model.as_os_str().to_owned();
    path.push(".json");
    PathBuf::from(path)
}

#[async_trait]
impl SpeechBackend for PiperBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_format(&self) -> SourceFormat {
        SourceFormat::Pcm {
            sample_rate: self.sample_rate,
            channels: 1,
        }
    }

    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        ctx: &SynthesisContext,
    ) -> Result<AudioByteStream> {
        if !self.model.exists() {
            warn!(backend = %self.name, model = %self.model.display(), "piper model missing");
            let reason = format!("model {} not found", self.model.display());
            return Err(TtsError::unavailable(&self.name, reason));
        }
        let text: Result<Bytes> = Ok(Bytes::from(format!("{}\n", request.text)));
        let input = into_audio_stream(stream::iter([text]));
        Ok(run_filter(self.command(request), input, ctx.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VoiceParams;

    fn request(voice: VoiceParams) -> SynthesisRequest {
        SynthesisRequest {
            index: 0,
            text: "Hello.".into(),
            language: "en".into(),
            voice,
        }
    }

    #[test]
    fn test_command_arguments() {
        let backend = PiperBackend::new("piper-en", "piper", "/models/en.onnx", Some(22050))
            .with_speed(Some(1.1))
            .with_speaker(Some(3));
        let spec = backend.command(&request(VoiceParams::default()));
        assert_eq!(spec.program, "piper");
        assert_eq!(
            spec.args.join(" "),
            "--model /models/en.onnx --output-raw --length_scale 0.909 --noise_scale 0.667 --noise_w 0.8 --speaker 3"
        );
    }

    #[test]
    fn test_request_overrides_speaker_and_speed() {
        let backend = PiperBackend::new("p", "piper", "m.onnx", Some(16000));
        let spec = backend.command(&request(VoiceParams {
            voice: None,
            speaker: Some(1),
            speed: Some(2.0),
        }));
        assert!(spec.args.windows(2).any(|w| w == ["--length_scale", "0.500"]));
        assert!(spec.args.windows(2).any(|w| w == ["--speaker", "1"]));
        assert_eq!(
            backend.source_format(),
            SourceFormat::Pcm { sample_rate: 16000, channels: 1 }
        );
    }

    #[test]
    fn test_sample_rate_from_sidecar() {
        let dir = std::env::temp_dir().join(format!("piper-sidecar-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let model = dir.join("voice.onnx");
        std::fs::write(dir.join("voice.onnx.json"), r#"{"audio":{"sample_rate":16000}}"#).unwrap();
        let backend = PiperBackend::new("p", "piper", &model, None);
        assert_eq!(backend.sample_rate, 16000);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_model_is_unavailable() {
        let backend = PiperBackend::new("p", "piper", "/nonexistent/model.onnx", None);
        let ctx = SynthesisContext::detached(4096);
        let err = backend.synthesize(&request(VoiceParams::default()), &ctx).await.err().unwrap();
        assert!(matches!(err, TtsError::BackendUnavailable { .. }));
    }
}
