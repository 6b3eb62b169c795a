//! Real-time speech for streamed LLM output.
//!
//! Text deltas are cut into sentences ([`segmenter`]), cleaned of markup
//! ([`sanitize`]), voiced by whichever engine serves the language
//! ([`router`], [`backend`]), normalized to one PCM format ([`format`]) and
//! delivered in order behind a single streaming WAV header ([`stream`]).

pub mod backend;
pub mod error;
pub mod format;
pub mod process;
pub mod router;
pub mod sanitize;
pub mod segmenter;
pub mod session;
pub mod stream;
pub mod voices;
pub mod wav;

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;

pub use backend::{SpeechBackend, SynthesisRequest, VoiceParams};
pub use error::{PipelineError, Result, TtsError};
pub use format::{CanonicalFormat, DecoderConfig, Normalizer, SourceFormat};
pub use process::{CommandSpec, ProcessTracker};
pub use router::BackendRouter;
pub use sanitize::sanitize;
pub use segmenter::{segment_text, Sentence, SentenceSegmenter};
pub use session::{SessionStats, StatsSnapshot, SynthesisContext};
pub use stream::{AudioChunk, PipelineConfig, QueueStats, SessionRequest, StreamSession};
pub use voices::VoiceMap;

/// Audio bytes as they come out of a backend or a normalization stage.
pub type AudioByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub fn into_audio_stream<S>(stream: S) -> AudioByteStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    Box::pin(stream)
}
