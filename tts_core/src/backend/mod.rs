//! Speech engines that turn one sentence into a raw audio byte stream.

mod espeak;
mod piper;
mod remote;

pub use espeak::EspeakBackend;
pub use piper::PiperBackend;
pub use remote::RemoteBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::format::SourceFormat;
use crate::session::SynthesisContext;
use crate::AudioByteStream;

/// Per-request voice overrides. Backends ignore fields they have no use for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    /// Named voice for engines that have them (remote services).
    #[serde(default)]
    pub voice: Option<String>,
    /// Speaker id for multi-speaker local models.
    #[serde(default)]
    pub speaker: Option<i64>,
    /// Speaking rate multiplier, 1.0 is the engine's natural pace.
    #[serde(default)]
    pub speed: Option<f32>,
}

/// One sentence to voice.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub index: usize,
    pub text: String,
    pub language: String,
    pub voice: VoiceParams,
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Format of the bytes [`synthesize`](Self::synthesize) produces.
    fn source_format(&self) -> SourceFormat;

    /// Starts synthesis. An `Err` means the engine could not start at all;
    /// errors inside the returned stream mean it failed part way.
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        ctx: &SynthesisContext,
    ) -> Result<AudioByteStream>;
}

pub(crate) fn effective_speed(request: &SynthesisRequest, configured: Option<f32>) -> f32 {
    request
        .voice
        .speed
        .or(configured)
        .filter(|s| s.is_finite() && *s > 0.0)
        .unwrap_or(1.0)
}
