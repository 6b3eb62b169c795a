use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tracing::debug;

use super::{SpeechBackend, SynthesisRequest};
use crate::error::{Result, TtsError};
use crate::format::SourceFormat;
use crate::session::SynthesisContext;
use crate::{into_audio_stream, AudioByteStream};

#[derive(Serialize)]
struct RemoteRequest<'a> {
    text: &'a str,
    voice: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
}

/// HTTP speech service that streams MP3 back for a posted sentence.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    name: String,
    client: reqwest::Client,
    url: String,
    voice: String,
    api_key: Option<String>,
}

impl RemoteBackend {
    pub fn new(
        name: impl Into<String>,
        client: reqwest::Client,
        url: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            url: url.into(),
            voice: voice.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }
}

#[async_trait]
impl SpeechBackend for RemoteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_format(&self) -> SourceFormat {
        SourceFormat::Mp3
    }

    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        ctx: &SynthesisContext,
    ) -> Result<AudioByteStream> {
        let voice = request.voice.voice.as_deref().unwrap_or(&self.voice);
        let body = RemoteRequest {
            text: &request.text,
            voice,
            format: "mp3",
            speed: request.voice.speed,
        };
        let mut builder = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TtsError::Cancelled),
            response = builder.send() => response.map_err(|e| TtsError::unavailable(&self.name, e))?,
        };
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TtsError::unavailable(
                &self.name,
                format!("HTTP {}: {}", status.as_u16(), detail.trim()),
            ));
        }
        debug!(backend = %self.name, voice, "remote synthesis started");

        let cancel = ctx.cancel.clone();
        let audio = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TtsError::from))
            .take_until(cancel.cancelled_owned());
        Ok(into_audio_stream(audio))
    }
}
