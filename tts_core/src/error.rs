use thiserror::Error;

/// Failures raised while turning one sentence into canonical audio.
///
/// None of these end a session on their own: the router falls back to the
/// next backend or drops the sentence, and only [`PipelineError`] reaches the
/// client.
#[derive(Debug, Error)]
pub enum TtsError {
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("transcode failed: {0}")]
    TranscodeFailure(String),

    #[error("'{program}' exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid voice map: {0}")]
    Config(String),

    #[error("synthesis cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl TtsError {
    pub fn unavailable(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// Folds a decoder-side failure into [`TtsError::TranscodeFailure`].
    pub(crate) fn into_transcode(self) -> Self {
        match self {
            Self::Cancelled | Self::TranscodeFailure(_) => self,
            other => Self::TranscodeFailure(other.to_string()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, TtsError>;

/// Session-level failures that surface on the delivery stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("upstream generation failed: {0}")]
    UpstreamGeneration(String),

    #[error("transport closed")]
    TransportClosed,
}
