// Request and streaming-session metrics

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tts_core::StatsSnapshot;

const MAX_SAMPLES: usize = 1000;

/// Running min/max/mean plus the last samples for percentiles.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    count: Arc<AtomicU64>,
    total_ms: Arc<AtomicU64>,
    min_ms: Arc<AtomicU64>,
    max_ms: Arc<AtomicU64>,
    samples: Arc<Mutex<Vec<u64>>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
            total_ms: Arc::new(AtomicU64::new(0)),
            min_ms: Arc::new(AtomicU64::new(u64::MAX)),
            max_ms: Arc::new(AtomicU64::new(0)),
            samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);

        if let Ok(mut samples) = self.samples.lock() {
            samples.push(ms);
            if samples.len() > MAX_SAMPLES {
                samples.remove(0);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LatencyStats {
        let count = self.count();
        let avg_ms = if count == 0 {
            0.0
        } else {
            self.total_ms.load(Ordering::Relaxed) as f64 / count as f64
        };
        let min = self.min_ms.load(Ordering::Relaxed);
        LatencyStats {
            avg_ms,
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max_ms.load(Ordering::Relaxed),
            p50_ms: self.percentile(50),
            p95_ms: self.percentile(95),
            p99_ms: self.percentile(99),
        }
    }

    fn percentile(&self, p: u8) -> u64 {
        let Ok(samples) = self.samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
        sorted[index]
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    requests: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    latency: LatencyTracker,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            latency: LatencyTracker::new(),
        }
    }

    /// Records one request; for streaming endpoints `started` measures the
    /// time until response headers were ready.
    pub fn record(&self, started: Instant, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(started.elapsed().as_millis() as u64);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            request_count: self.requests(),
            error_count: self.errors.load(Ordering::Relaxed),
            latency: self.latency.stats(),
        }
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregates over finished audio streaming sessions.
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    started: Arc<AtomicU64>,
    active: Arc<AtomicU64>,
    finished: Arc<AtomicU64>,
    sentences: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    failed_sentences: Arc<AtomicU64>,
    fallbacks: Arc<AtomicU64>,
    audio_bytes: Arc<AtomicU64>,
    time_to_first_audio: LatencyTracker,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            started: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicU64::new(0)),
            finished: Arc::new(AtomicU64::new(0)),
            sentences: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
            failed_sentences: Arc::new(AtomicU64::new(0)),
            fallbacks: Arc::new(AtomicU64::new(0)),
            audio_bytes: Arc::new(AtomicU64::new(0)),
            time_to_first_audio: LatencyTracker::new(),
        }
    }

    pub fn session_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_finished(&self, snapshot: &StatsSnapshot) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.sentences.fetch_add(snapshot.sentences, Ordering::Relaxed);
        self.skipped.fetch_add(snapshot.skipped, Ordering::Relaxed);
        self.failed_sentences
            .fetch_add(snapshot.failed_sentences, Ordering::Relaxed);
        self.fallbacks.fetch_add(snapshot.fallbacks, Ordering::Relaxed);
        self.audio_bytes.fetch_add(snapshot.bytes, Ordering::Relaxed);
        if let Some(ttfa) = snapshot.time_to_first_audio_ms {
            self.time_to_first_audio.record(ttfa);
        }
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            sessions_started: self.started.load(Ordering::Relaxed),
            sessions_active: self.active(),
            sessions_finished: self.finished.load(Ordering::Relaxed),
            sentences: self.sentences.load(Ordering::Relaxed),
            skipped_sentences: self.skipped.load(Ordering::Relaxed),
            failed_sentences: self.failed_sentences.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            audio_bytes: self.audio_bytes.load(Ordering::Relaxed),
            time_to_first_audio: self.time_to_first_audio.stats(),
        }
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct AppMetrics {
    pub tts: EndpointMetrics,
    pub voice_stream: EndpointMetrics,
    pub speak_stream: EndpointMetrics,
    pub text_stream: EndpointMetrics,
    pub text: EndpointMetrics,
    pub voice_text: EndpointMetrics,
    pub streams: StreamMetrics,
    started: Instant,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self {
            tts: EndpointMetrics::new(),
            voice_stream: EndpointMetrics::new(),
            speak_stream: EndpointMetrics::new(),
            text_stream: EndpointMetrics::new(),
            text: EndpointMetrics::new(),
            voice_text: EndpointMetrics::new(),
            streams: StreamMetrics::new(),
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn request_count(&self) -> u64 {
        [
            &self.tts,
            &self.voice_stream,
            &self.speak_stream,
            &self.text_stream,
            &self.text,
            &self.voice_text,
        ]
        .iter()
        .map(|e| e.requests())
        .sum()
    }

    pub fn report(&self) -> DetailedMetricsResponse {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("tts", self.tts.stats());
        endpoints.insert("voice_stream", self.voice_stream.stats());
        endpoints.insert("speak_stream", self.speak_stream.stats());
        endpoints.insert("stream_text", self.text_stream.stats());
        endpoints.insert("text", self.text.stats());
        endpoints.insert("voice_text", self.voice_text.stats());

        DetailedMetricsResponse {
            timestamp: Utc::now(),
            system: system_metrics(self.request_count(), self.uptime()),
            endpoints,
            streams: self.streams.stats(),
        }
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn system_metrics(request_count: u64, uptime: Duration) -> SystemMetrics {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    SystemMetrics {
        cpu_usage_percent: system.global_cpu_info().cpu_usage(),
        memory_used_mb: memory_used / 1024 / 1024,
        memory_total_mb: memory_total / 1024 / 1024,
        memory_usage_percent,
        request_count,
        uptime_seconds: uptime.as_secs(),
        system_load: load_average(),
    }
}

#[cfg(unix)]
fn load_average() -> Option<f64> {
    std::fs::read_to_string("/proc/loadavg")
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(not(unix))]
fn load_average() -> Option<f64> {
    None
}

#[derive(Serialize)]
pub struct DetailedMetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub endpoints: BTreeMap<&'static str, EndpointStats>,
    pub streams: StreamStats,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub latency: LatencyStats,
}

#[derive(Debug, Serialize)]
pub struct StreamStats {
    pub sessions_started: u64,
    pub sessions_active: u64,
    pub sessions_finished: u64,
    pub sentences: u64,
    pub skipped_sentences: u64,
    pub failed_sentences: u64,
    pub fallbacks: u64,
    pub audio_bytes: u64,
    pub time_to_first_audio: LatencyStats,
}
