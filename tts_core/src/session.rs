use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::process::ProcessTracker;

/// Everything a synthesis attempt needs from the session that owns it.
#[derive(Debug, Clone)]
pub struct SynthesisContext {
    pub cancel: CancellationToken,
    pub processes: ProcessTracker,
    pub stats: Arc<SessionStats>,
    /// Upper bound for chunks read from child processes.
    pub chunk_bytes: usize,
}

impl SynthesisContext {
    pub fn new(cancel: CancellationToken, chunk_bytes: usize) -> Self {
        Self {
            cancel,
            processes: ProcessTracker::new(),
            stats: Arc::new(SessionStats::new()),
            chunk_bytes,
        }
    }

    /// A context with its own token, for one-off synthesis outside a session.
    pub fn detached(chunk_bytes: usize) -> Self {
        Self::new(CancellationToken::new(), chunk_bytes)
    }
}

/// Per-session counters, updated from the pipeline tasks.
#[derive(Debug)]
pub struct SessionStats {
    started: Instant,
    sentences: AtomicU64,
    skipped: AtomicU64,
    chunks: AtomicU64,
    bytes: AtomicU64,
    fallbacks: AtomicU64,
    failed_sentences: AtomicU64,
    first_audio_ms: AtomicU64,
}

const NO_AUDIO_YET: u64 = u64::MAX;

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            sentences: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            failed_sentences: AtomicU64::new(0),
            first_audio_ms: AtomicU64::new(NO_AUDIO_YET),
        }
    }

    pub fn record_sentence(&self) {
        self.sentences.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, len: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_sentence(&self) {
        self.failed_sentences.fetch_add(1, Ordering::Relaxed);
    }

    /// Records time to first audio; later calls keep the first value.
    pub fn mark_first_audio(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let _ = self.first_audio_ms.compare_exchange(
            NO_AUDIO_YET,
            elapsed,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn time_to_first_audio(&self) -> Option<Duration> {
        match self.first_audio_ms.load(Ordering::Relaxed) {
            NO_AUDIO_YET => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sentences: self.sentences.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            failed_sentences: self.failed_sentences.load(Ordering::Relaxed),
            time_to_first_audio_ms: self.time_to_first_audio().map(|d| d.as_millis() as u64),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sentences: u64,
    pub skipped: u64,
    pub chunks: u64,
    pub bytes: u64,
    pub fallbacks: u64,
    pub failed_sentences: u64,
    pub time_to_first_audio_ms: Option<u64>,
    pub elapsed_ms: u64,
}
