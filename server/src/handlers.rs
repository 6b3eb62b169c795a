use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName},
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse, Response,
    },
    Json,
};
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use llm_core::{default_system_prompt, detect_language, ChatMessage, QueryBudget};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use tts_core::{
    sanitize, wav, PipelineError, SessionRequest, SessionStats, SentenceSegmenter, StreamSession,
    VoiceParams,
};

use crate::error::ApiError;
use crate::metrics::StreamMetrics;
use crate::validation::{route_language, validate_session_id, validate_text_request};
use crate::AppState;

const X_STREAM_TYPE: HeaderName = HeaderName::from_static("x-stream-type");

/// Text to speak as given, without a language model.
#[derive(Debug, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    pub language: Option<String>,
    #[serde(default)]
    pub voice: VoiceParams,
}

/// A user query answered by the language model.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    pub language: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub voice: VoiceParams,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TtsResponse {
    pub audio_base64: String,
    pub sample_rate: u32,
    pub duration_ms: u64,
    pub sentences: u64,
}

/// Whole language model reply, without audio.
#[derive(Debug, Serialize, Deserialize)]
pub struct TextReply {
    pub response: String,
    pub language: String,
    pub session_id: Option<String>,
}

/// Language model reply together with its synthesized audio.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoiceTextResponse {
    pub audio_base64: String,
    pub response_text: String,
    pub language: String,
    /// Bytes of PCM audio inside the WAV file.
    pub audio_size: usize,
    pub sample_rate: u32,
    pub duration_ms: u64,
    pub sentences: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub language: String,
    pub backend: String,
    pub fallback: Vec<String>,
    pub default: bool,
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_voices(State(state): State<AppState>) -> Json<Vec<VoiceInfo>> {
    let default_language = state.router.default_language();
    let voices = state
        .router
        .languages()
        .into_iter()
        .filter_map(|language| {
            let route = state.router.route(&language)?;
            Some(VoiceInfo {
                default: language == default_language,
                backend: route.backend.clone(),
                fallback: route.fallback.clone(),
                language,
            })
        })
        .collect();
    Json(voices)
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.report())
}

/// Explicit language code, or a guess from the script of `text`.
fn resolve_language(requested: Option<&str>, text: &str) -> String {
    match requested {
        Some(code) => route_language(code).to_string(),
        None => detect_language(text).to_string(),
    }
}

fn single_text(text: String) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
    stream::iter([Ok(text)])
}

fn query_messages(text: &str) -> [ChatMessage; 2] {
    [
        ChatMessage::system(default_system_prompt()),
        ChatMessage::user(text),
    ]
}

/// Synthesizes the whole text and returns it as one base64 WAV file.
pub async fn tts_endpoint(
    State(state): State<AppState>,
    Json(req): Json<SpeakRequest>,
) -> Result<Json<TtsResponse>, ApiError> {
    let started = Instant::now();
    let result = synthesize_whole(&state, req).await;
    state.metrics.tts.record(started, result.is_ok());
    result.map(Json)
}

async fn synthesize_whole(state: &AppState, req: SpeakRequest) -> Result<TtsResponse, ApiError> {
    validate_text_request(&req.text, req.language.as_deref())?;
    let language = resolve_language(req.language.as_deref(), &req.text);
    let audio = synthesize_all(state, single_text(req.text), language, req.voice).await?;

    Ok(TtsResponse {
        audio_base64: audio.wav_base64,
        sample_rate: audio.sample_rate,
        duration_ms: audio.duration_ms,
        sentences: audio.sentences,
    })
}

struct WholeAudio {
    wav_base64: String,
    pcm_bytes: usize,
    sample_rate: u32,
    duration_ms: u64,
    sentences: u64,
}

/// Runs a session without warm-up to completion and packs its PCM into one
/// WAV file.
async fn synthesize_all<S, E>(
    state: &AppState,
    source: S,
    language: String,
    voice: VoiceParams,
) -> Result<WholeAudio, ApiError>
where
    S: Stream<Item = Result<String, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let config = tts_core::PipelineConfig {
        warmup: Duration::ZERO,
        ..state.config.pipeline_config()
    };
    let session = StreamSession::start(
        source,
        SessionRequest { language, voice },
        state.router.clone(),
        config,
    );
    let format = *session.format();
    let stats = session.stats();

    let mut body = Box::pin(session.into_stream());
    // the header comes first unless the upstream failed before any text
    if let Some(first) = body.next().await {
        first?;
    }
    let mut pcm = Vec::new();
    while let Some(item) = body.next().await {
        pcm.extend_from_slice(&item?);
    }
    if pcm.is_empty() {
        return Err(ApiError::Synthesis("no audio was produced".to_string()));
    }

    let frames = pcm.len() as u64 / u64::from(format.block_align());
    let wav_base64 = wav::encode_wav_base64(&pcm, &format)
        .map_err(|e| ApiError::Synthesis(format!("WAV encoding error: {e}")))?;

    Ok(WholeAudio {
        wav_base64,
        pcm_bytes: pcm.len(),
        sample_rate: format.sample_rate,
        duration_ms: frames * 1000 / u64::from(format.sample_rate.max(1)),
        sentences: stats.snapshot().sentences,
    })
}

/// Answers a query with the whole language model reply as text.
pub async fn text_endpoint(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<TextReply>, ApiError> {
    let started = Instant::now();
    let result = answer_text(&state, req).await;
    state.metrics.text.record(started, result.is_ok());
    result.map(Json)
}

async fn answer_text(state: &AppState, req: QueryRequest) -> Result<TextReply, ApiError> {
    validate_text_request(&req.text, req.language.as_deref())?;
    if let Some(id) = &req.session_id {
        validate_session_id(id)?;
    }
    let language = resolve_language(req.language.as_deref(), &req.text);
    let budget = QueryBudget::for_query(&req.text);
    debug!(%language, max_tokens = budget.max_tokens, "text query");

    let reply = state.llm.complete(&query_messages(&req.text), budget).await?;
    Ok(TextReply {
        response: sanitize(&reply),
        language,
        session_id: req.session_id,
    })
}

/// Answers a query with the language model and returns the reply text along
/// with the whole spoken reply as one base64 WAV file.
pub async fn voice_text(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<VoiceTextResponse>, ApiError> {
    let started = Instant::now();
    let result = speak_reply(&state, req).await;
    state.metrics.voice_text.record(started, result.is_ok());
    result.map(Json)
}

async fn speak_reply(state: &AppState, req: QueryRequest) -> Result<VoiceTextResponse, ApiError> {
    validate_text_request(&req.text, req.language.as_deref())?;
    if let Some(id) = &req.session_id {
        validate_session_id(id)?;
    }
    let language = resolve_language(req.language.as_deref(), &req.text);
    let budget = QueryBudget::for_query(&req.text);
    info!(%language, session_id = ?req.session_id, "voice text requested");

    let deltas = state.llm.stream_chat(&query_messages(&req.text), budget).await?;
    let reply = Arc::new(Mutex::new(String::new()));
    let transcript = reply.clone();
    let deltas = deltas.inspect(move |item| {
        if let (Ok(delta), Ok(mut text)) = (item, transcript.lock()) {
            text.push_str(delta);
        }
    });

    let audio = synthesize_all(state, deltas, language.clone(), req.voice).await?;
    let reply = reply.lock().map(|text| text.clone()).unwrap_or_default();

    Ok(VoiceTextResponse {
        audio_base64: audio.wav_base64,
        response_text: sanitize(&reply),
        language,
        audio_size: audio.pcm_bytes,
        sample_rate: audio.sample_rate,
        duration_ms: audio.duration_ms,
        sentences: audio.sentences,
    })
}

/// Speaks the given text as a chunked WAV stream.
pub async fn speak_stream(
    State(state): State<AppState>,
    Json(req): Json<SpeakRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let result = speak_stream_response(&state, req).await;
    state.metrics.speak_stream.record(started, result.is_ok());
    result
}

async fn speak_stream_response(state: &AppState, req: SpeakRequest) -> Result<Response, ApiError> {
    validate_text_request(&req.text, req.language.as_deref())?;
    let language = resolve_language(req.language.as_deref(), &req.text);

    let session = StreamSession::start(
        single_text(req.text),
        SessionRequest {
            language,
            voice: req.voice,
        },
        state.router.clone(),
        state.config.pipeline_config(),
    );
    audio_response(state, session).await
}

/// Answers a query with the language model and speaks the reply sentence by
/// sentence while it is still being generated.
pub async fn voice_stream(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let result = voice_stream_response(&state, req).await;
    state.metrics.voice_stream.record(started, result.is_ok());
    result
}

async fn voice_stream_response(state: &AppState, req: QueryRequest) -> Result<Response, ApiError> {
    validate_text_request(&req.text, req.language.as_deref())?;
    if let Some(id) = &req.session_id {
        validate_session_id(id)?;
    }
    let language = resolve_language(req.language.as_deref(), &req.text);
    let budget = QueryBudget::for_query(&req.text);
    info!(
        %language,
        session_id = ?req.session_id,
        max_tokens = budget.max_tokens,
        "voice stream requested"
    );

    let deltas = state.llm.stream_chat(&query_messages(&req.text), budget).await?;
    let session = StreamSession::start(
        deltas,
        SessionRequest {
            language,
            voice: req.voice,
        },
        state.router.clone(),
        state.config.pipeline_config(),
    );
    audio_response(state, session).await
}

/// Waits for the first body item so an upstream failure can still become an
/// error status, then streams the rest.
async fn audio_response(state: &AppState, session: StreamSession) -> Result<Response, ApiError> {
    state.metrics.streams.session_started();
    let stats = session.stats();
    let mut body = RecordedBody {
        inner: session.into_stream().boxed(),
        stats,
        streams: state.metrics.streams.clone(),
    };

    let first = match body.next().await {
        Some(Ok(bytes)) => bytes,
        Some(Err(e)) => return Err(e.into()),
        None => Bytes::new(),
    };
    let body = stream::once(async move { Ok::<_, PipelineError>(first) }).chain(body);

    Ok((
        [
            (header::CONTENT_TYPE, "audio/wav"),
            (header::CACHE_CONTROL, "no-cache"),
            (X_STREAM_TYPE, "real-time-sentence-streaming"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

/// Response body that reports its session to the stream metrics when the
/// client finishes or goes away.
struct RecordedBody {
    inner: BoxStream<'static, Result<Bytes, PipelineError>>,
    stats: Arc<SessionStats>,
    streams: StreamMetrics,
}

impl Stream for RecordedBody {
    type Item = Result<Bytes, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for RecordedBody {
    fn drop(&mut self) {
        let snapshot = self.stats.snapshot();
        debug!(?snapshot, "audio stream closed");
        self.streams.session_finished(&snapshot);
    }
}

/// Streams the sanitized sentences of a language model reply as server-sent
/// events: `sentence` for each, then `error` if generation broke off, then
/// `complete`.
pub async fn stream_text(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<KeepAliveStream<BoxStream<'static, Result<Event, axum::Error>>>>, ApiError> {
    let started = Instant::now();
    let result = sentence_events(&state, req).await;
    state.metrics.text_stream.record(started, result.is_ok());
    result.map(|events| Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn sentence_events(
    state: &AppState,
    req: QueryRequest,
) -> Result<BoxStream<'static, Result<Event, axum::Error>>, ApiError> {
    validate_text_request(&req.text, req.language.as_deref())?;
    if let Some(id) = &req.session_id {
        validate_session_id(id)?;
    }
    let language = resolve_language(req.language.as_deref(), &req.text);
    let budget = QueryBudget::for_query(&req.text);
    let mut deltas = state.llm.stream_chat(&query_messages(&req.text), budget).await?;

    let events = async_stream::stream! {
        let mut segmenter = SentenceSegmenter::new(language.clone());
        let mut sent = 0usize;
        let mut failure = None;
        let mut done = false;

        while !done {
            let sentences = match deltas.next().await {
                Some(Ok(delta)) => segmenter.ingest(&delta),
                Some(Err(e)) => {
                    warn!(error = %e, "text stream broke off");
                    failure = Some(e.to_string());
                    done = true;
                    segmenter.flush().into_iter().collect()
                }
                None => {
                    done = true;
                    segmenter.flush().into_iter().collect()
                }
            };
            for sentence in sentences {
                let text = sanitize(sentence.text());
                if text.is_empty() {
                    continue;
                }
                yield Event::default()
                    .event("sentence")
                    .json_data(json!({ "index": sent, "text": text, "language": language }));
                sent += 1;
            }
        }

        if let Some(error) = failure {
            yield Event::default().event("error").json_data(json!({ "error": error }));
        }
        yield Event::default().event("complete").json_data(json!({ "sentences": sent }));
    };
    Ok(events.boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_language() {
        assert_eq!(resolve_language(Some("hi_IN"), "hello"), "hi");
        assert_eq!(resolve_language(None, "నమస్కారం"), "te");
        assert_eq!(resolve_language(None, "hello"), "en");
    }

    #[test]
    fn test_query_messages_lead_with_system_prompt() {
        let messages = query_messages("hi");
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "hi");
    }
}
