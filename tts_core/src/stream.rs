//! Session pipeline: streamed text deltas in, one canonical WAV byte stream
//! out.
//!
//! A single producer task per session reads the text source, cuts it into
//! sentences, and hands each sentence to its own synthesis task. Up to
//! `synthesis_lookahead` sentences synthesize ahead of the one being
//! delivered. A sequencer forwards their audio strictly in sentence order
//! into a bounded delivery queue; when the consumer stops reading, the queue
//! fills and everything upstream of it blocks.
//!
//! The consumer side emits the 44-byte streaming header immediately before
//! the first audio (or alone, if the response produced none) and then raw
//! PCM. Dropping the session, or a failed write in [`StreamSession::deliver`],
//! cancels all in-flight work and reaps any child processes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::backend::{SynthesisRequest, VoiceParams};
use crate::error::PipelineError;
use crate::format::CanonicalFormat;
use crate::process::ProcessTracker;
use crate::router::BackendRouter;
use crate::sanitize::sanitize;
use crate::segmenter::{Sentence, SentenceSegmenter};
use crate::session::{SessionStats, StatsSnapshot, SynthesisContext};
use crate::wav;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Delivery queue bound, in chunks.
    pub queue_depth: usize,
    /// Sentences allowed to synthesize ahead of the one being delivered.
    pub synthesis_lookahead: usize,
    /// Silence emitted after the header to prime client-side decoders.
    pub warmup: Duration,
    /// Overall limit on the text source.
    pub upstream_timeout: Option<Duration>,
    /// How long teardown may take before remaining tasks are aborted.
    pub shutdown_grace: Duration,
    /// Read size for child process output.
    pub chunk_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 8,
            synthesis_lookahead: 1,
            warmup: Duration::ZERO,
            upstream_timeout: None,
            shutdown_grace: Duration::from_secs(2),
            chunk_bytes: 4096,
        }
    }
}

/// Language and voice for every sentence of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub language: String,
    pub voice: VoiceParams,
}

impl SessionRequest {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            voice: VoiceParams::default(),
        }
    }
}

/// Canonical PCM belonging to one sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub sentence_index: usize,
    /// Position among all chunks of the session.
    pub sequence: u64,
    pub data: Bytes,
}

/// Depth of the delivery queue as observed by the producer.
#[derive(Debug, Clone)]
pub struct QueueStats {
    bound: usize,
    high_water: Arc<AtomicUsize>,
}

impl QueueStats {
    fn new(bound: usize) -> Self {
        Self {
            bound,
            high_water: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Largest number of undelivered chunks seen at once.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    fn observe(&self, depth: usize) {
        self.high_water.fetch_max(depth, Ordering::Relaxed);
    }
}

type Delivery = Result<AudioChunk, PipelineError>;
type TextSource = BoxStream<'static, Result<String, String>>;

#[derive(Clone)]
struct DeliveryQueue {
    tx: mpsc::Sender<Delivery>,
    stats: QueueStats,
}

impl DeliveryQueue {
    /// Returns false once the consumer is gone or the session is cancelled.
    async fn push(&self, item: Delivery, cancel: &CancellationToken) -> bool {
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        };
        if sent {
            self.stats.observe(self.tx.max_capacity() - self.tx.capacity());
        }
        sent
    }
}

enum Job {
    Sentence {
        index: usize,
        chunks: mpsc::Receiver<Bytes>,
        slot: OwnedSemaphorePermit,
    },
    Failed(PipelineError),
}

enum Upstream {
    Delta(String),
    End,
    Failed(String),
}

/// One live text-to-speech response.
pub struct StreamSession {
    rx: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    ctx: SynthesisContext,
    queue: QueueStats,
    format: CanonicalFormat,
    warmup: Duration,
    grace: Duration,
    pending: VecDeque<Bytes>,
    header_sent: bool,
    finished: bool,
}

impl StreamSession {
    /// Spawns the producer for `source` and returns the consumer handle.
    /// Must be called inside a Tokio runtime.
    pub fn start<S, E>(
        source: S,
        request: SessionRequest,
        router: Arc<BackendRouter>,
        config: PipelineConfig,
    ) -> Self
    where
        S: Stream<Item = Result<String, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let source: TextSource = source.map(|item| item.map_err(|e| e.to_string())).boxed();
        let cancel = CancellationToken::new();
        let ctx = SynthesisContext::new(cancel.clone(), config.chunk_bytes);
        let depth = config.queue_depth.max(1);
        let (tx, rx) = mpsc::channel(depth);
        let queue = QueueStats::new(depth);
        let format = *router.normalizer().format();

        let span = info_span!("session", language = %request.language);
        let producer = tokio::spawn(
            produce(
                source,
                request,
                router,
                config.clone(),
                ctx.clone(),
                DeliveryQueue {
                    tx,
                    stats: queue.clone(),
                },
            )
            .instrument(span),
        );

        Self {
            rx,
            cancel,
            producer: Some(producer),
            ctx,
            queue,
            format,
            warmup: config.warmup,
            grace: config.shutdown_grace,
            pending: VecDeque::new(),
            header_sent: false,
            finished: false,
        }
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.ctx.stats.clone()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.clone()
    }

    pub fn processes(&self) -> ProcessTracker {
        self.ctx.processes.clone()
    }

    pub fn format(&self) -> &CanonicalFormat {
        &self.format
    }

    /// Stops all work for this session without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next item from the delivery queue, bypassing header framing.
    pub async fn recv_chunk(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Next piece of the response body: header, optional warm-up silence,
    /// then PCM. An error is only ever the first and last item.
    pub async fn next_bytes(&mut self) -> Option<Result<Bytes, PipelineError>> {
        loop {
            if let Some(bytes) = self.pending.pop_front() {
                return Some(Ok(bytes));
            }
            if self.finished {
                return None;
            }
            match self.rx.recv().await {
                Some(Ok(chunk)) => {
                    if !self.header_sent {
                        self.begin_output();
                    }
                    self.pending.push_back(chunk.data);
                }
                Some(Err(e)) if !self.header_sent => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "late pipeline error after audio started");
                }
                None => {
                    self.finished = true;
                    if !self.header_sent {
                        self.header_sent = true;
                        return Some(Ok(wav::streaming_header(&self.format)));
                    }
                }
            }
        }
    }

    fn begin_output(&mut self) {
        self.header_sent = true;
        self.ctx.stats.mark_first_audio();
        self.pending.push_back(wav::streaming_header(&self.format));
        if !self.warmup.is_zero() {
            self.pending
                .push_back(wav::silence(self.warmup.as_millis() as u64, &self.format));
        }
    }

    /// The response body as a stream. Dropping it cancels the session.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, PipelineError>> + Send + 'static {
        stream::unfold(self, |mut session| async move {
            session.next_bytes().await.map(|item| (item, session))
        })
    }

    /// Writes the whole response to `sink`. A failed write is treated as the
    /// client going away: the session is cancelled and torn down before
    /// returning [`PipelineError::TransportClosed`].
    pub async fn deliver<W>(mut self, sink: &mut W) -> Result<StatsSnapshot, PipelineError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(item) = self.next_bytes().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.close().await;
                    return Err(e);
                }
            };
            if let Err(e) = sink.write_all(&bytes).await {
                debug!(error = %e, "client transport closed");
                self.close().await;
                return Err(PipelineError::TransportClosed);
            }
        }
        if let Err(e) = sink.flush().await {
            debug!(error = %e, "client transport closed on flush");
            self.close().await;
            return Err(PipelineError::TransportClosed);
        }
        Ok(self.shutdown().await)
    }

    /// Cancels outstanding work and waits, up to the grace period, for every
    /// task and child process to finish.
    pub async fn shutdown(mut self) -> StatsSnapshot {
        self.close().await;
        self.ctx.stats.snapshot()
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(producer) = self.producer.take() {
            reap_producer(producer, self.grace).await;
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        let Some(producer) = self.producer.take() else {
            return;
        };
        if producer.is_finished() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(reap_producer(producer, self.grace));
            }
            Err(_) => producer.abort(),
        }
    }
}

async fn reap_producer(producer: JoinHandle<()>, grace: Duration) {
    let abort = producer.abort_handle();
    match tokio::time::timeout(grace, producer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => warn!(error = %e, "session producer panicked"),
        Err(_) => {
            warn!(?grace, "session producer did not stop in time, aborting");
            abort.abort();
        }
    }
}

async fn produce(
    source: TextSource,
    request: SessionRequest,
    router: Arc<BackendRouter>,
    config: PipelineConfig,
    ctx: SynthesisContext,
    queue: DeliveryQueue,
) {
    let (jobs_tx, jobs_rx) = mpsc::channel(config.synthesis_lookahead + 1);
    let dispatcher = Dispatcher {
        slots: Arc::new(Semaphore::new(config.synthesis_lookahead + 1)),
        router,
        request,
        config,
        ctx: ctx.clone(),
        jobs: jobs_tx,
        tasks: JoinSet::new(),
    };

    let (mut tasks, ()) = tokio::join!(
        dispatcher.run(source),
        sequence(jobs_rx, queue, ctx.clone())
    );
    while tasks.join_next().await.is_some() {}

    let stats = ctx.stats.snapshot();
    if ctx.cancel.is_cancelled() {
        info!(sentences = stats.sentences, bytes = stats.bytes, "session cancelled");
    } else {
        info!(
            sentences = stats.sentences,
            skipped = stats.skipped,
            fallbacks = stats.fallbacks,
            failed = stats.failed_sentences,
            bytes = stats.bytes,
            ttfa_ms = ?stats.time_to_first_audio_ms,
            "session complete"
        );
    }
}

struct Dispatcher {
    slots: Arc<Semaphore>,
    router: Arc<BackendRouter>,
    request: SessionRequest,
    config: PipelineConfig,
    ctx: SynthesisContext,
    jobs: mpsc::Sender<Job>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    /// Consumes the text source. Returns the synthesis tasks still running;
    /// dropping `self` closes the job channel so the sequencer can finish.
    async fn run(mut self, mut source: TextSource) -> JoinSet<()> {
        let mut segmenter = SentenceSegmenter::new(self.request.language.clone());
        let deadline = self.config.upstream_timeout.map(|t| Instant::now() + t);
        let mut received = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return self.tasks,
                next = next_delta(&mut source, deadline) => next,
            };
            match next {
                Upstream::Delta(text) => {
                    received |= !text.is_empty();
                    for sentence in segmenter.ingest(&text) {
                        if !self.submit(sentence).await {
                            return self.tasks;
                        }
                    }
                }
                Upstream::End => break,
                Upstream::Failed(reason) if !received => {
                    warn!(%reason, "upstream failed before producing text");
                    let failed = Job::Failed(PipelineError::UpstreamGeneration(reason));
                    let _ = self.jobs.send(failed).await;
                    return self.tasks;
                }
                Upstream::Failed(reason) => {
                    warn!(%reason, "upstream failed mid-response, voicing what arrived");
                    break;
                }
            }
        }

        if let Some(rest) = segmenter.flush() {
            self.submit(rest).await;
        }
        self.tasks
    }

    async fn submit(&mut self, sentence: Sentence) -> bool {
        let text = sanitize(sentence.text());
        if text.is_empty() {
            self.ctx.stats.record_skipped();
            debug!(sentence = sentence.index(), "nothing speakable, skipped");
            return true;
        }
        self.ctx.stats.record_sentence();

        let slot = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => return false,
            slot = self.slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => return false,
            },
        };

        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let job = Job::Sentence {
            index: sentence.index(),
            chunks: rx,
            slot,
        };
        let queued = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => false,
            sent = self.jobs.send(job) => sent.is_ok(),
        };
        if !queued {
            return false;
        }

        debug!(sentence = sentence.index(), chars = text.chars().count(), "synthesizing");
        let request = SynthesisRequest {
            index: sentence.index(),
            text,
            language: sentence.language().to_string(),
            voice: self.request.voice.clone(),
        };
        self.tasks.spawn(synthesize_sentence(
            self.router.clone(),
            request,
            self.ctx.clone(),
            tx,
        ));
        true
    }
}

async fn next_delta(source: &mut TextSource, deadline: Option<Instant>) -> Upstream {
    let next = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, source.next()).await {
            Ok(next) => next,
            Err(_) => return Upstream::Failed("upstream generation timed out".to_string()),
        },
        None => source.next().await,
    };
    match next {
        Some(Ok(text)) => Upstream::Delta(text),
        Some(Err(reason)) => Upstream::Failed(reason),
        None => Upstream::End,
    }
}

async fn synthesize_sentence(
    router: Arc<BackendRouter>,
    request: SynthesisRequest,
    ctx: SynthesisContext,
    tx: mpsc::Sender<Bytes>,
) {
    let mut audio = router.speak(request, ctx.clone());
    loop {
        let chunk = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            chunk = audio.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let sent = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => false,
            sent = tx.send(chunk) => sent.is_ok(),
        };
        if !sent {
            break;
        }
    }
}

async fn sequence(mut jobs: mpsc::Receiver<Job>, queue: DeliveryQueue, ctx: SynthesisContext) {
    let mut sequence = 0u64;
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Sentence {
                index,
                mut chunks,
                slot: _slot,
            } => {
                while let Some(data) = chunks.recv().await {
                    ctx.stats.record_chunk(data.len());
                    let chunk = AudioChunk {
                        sentence_index: index,
                        sequence,
                        data,
                    };
                    sequence += 1;
                    if !queue.push(Ok(chunk), &ctx.cancel).await {
                        return;
                    }
                }
            }
            Job::Failed(err) => {
                if !queue.push(Err(err), &ctx.cancel).await {
                    return;
                }
            }
        }
    }
}
