#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};

use tts_core::{
    into_audio_stream, AudioByteStream, BackendRouter, PipelineError, SourceFormat,
    SpeechBackend, SynthesisContext, SynthesisRequest, TtsError,
};

/// Scripted backend producing stereo PCM at the canonical rate. Every byte of
/// a sentence's audio equals the sentence index, so ordering is visible in
/// the output.
pub struct FakeBackend {
    pub name: String,
    pub chunks_per_sentence: usize,
    pub chunk_len: usize,
    pub delay: Duration,
    pub fail_to_start: bool,
    pub spoken: Mutex<Vec<String>>,
    pub produced: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            chunks_per_sentence: 2,
            chunk_len: 8,
            delay: Duration::ZERO,
            fail_to_start: false,
            spoken: Mutex::new(Vec::new()),
            produced: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn chunks(mut self, count: usize, len: usize) -> Self {
        self.chunks_per_sentence = count;
        self.chunk_len = len;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_to_start = true;
        self
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechBackend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_format(&self) -> SourceFormat {
        SourceFormat::Pcm {
            sample_rate: 22050,
            channels: 2,
        }
    }

    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        _ctx: &SynthesisContext,
    ) -> tts_core::Result<AudioByteStream> {
        if self.fail_to_start {
            return Err(TtsError::unavailable(&self.name, "scripted failure"));
        }
        self.spoken.lock().unwrap().push(request.text.clone());

        let count = self.chunks_per_sentence;
        let len = self.chunk_len;
        let delay = self.delay;
        let fill = request.index as u8;
        let produced = self.produced.clone();
        Ok(into_audio_stream(try_stream! {
            for _ in 0..count {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                produced.fetch_add(1, Ordering::SeqCst);
                yield Bytes::from(vec![fill; len]);
            }
        }))
    }
}

pub fn router(
    backends: Vec<Arc<dyn SpeechBackend>>,
    routes: &[(&str, &str, &[&str])],
) -> Arc<BackendRouter> {
    let mut builder = BackendRouter::builder("en");
    for backend in backends {
        builder = builder.backend(backend);
    }
    for (language, primary, fallback) in routes {
        builder = builder.route(*language, primary, fallback);
    }
    Arc::new(builder.build().unwrap())
}

pub fn deltas(parts: &[&str]) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
    let parts: Vec<Result<String, Infallible>> =
        parts.iter().map(|p| Ok(p.to_string())).collect();
    stream::iter(parts)
}

/// Collects a session body, splitting off the 44-byte header.
pub async fn collect_body<S>(body: S) -> Result<(Vec<u8>, Vec<u8>), PipelineError>
where
    S: Stream<Item = Result<Bytes, PipelineError>>,
{
    let mut body = Box::pin(body);
    let mut all = Vec::new();
    while let Some(item) = body.next().await {
        all.extend_from_slice(&item?);
    }
    assert!(all.len() >= 44, "body shorter than a WAV header");
    let pcm = all.split_off(44);
    Ok((all, pcm))
}
