//! Common utilities for server integration tests

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::stream;
use llm_core::{ChatClient, LlmConfig};
use server::config::ServerConfig;
use server::{build_router, AppState};
use tts_core::{
    into_audio_stream, AudioByteStream, BackendRouter, SourceFormat, SpeechBackend,
    SynthesisContext, SynthesisRequest, TtsError,
};

/// Canonical-format PCM backend: `chunks` chunks of `chunk_len` bytes per
/// sentence.
pub struct FakeBackend {
    name: String,
    chunks: usize,
    chunk_len: usize,
    failing: bool,
    spoken: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(name: &str, chunks: usize, chunk_len: usize) -> Self {
        Self {
            name: name.to_string(),
            chunks,
            chunk_len,
            failing: false,
            spoken: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
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
        if self.failing {
            return Err(TtsError::unavailable(&self.name, "offline"));
        }
        self.spoken.lock().unwrap().push(request.text.clone());
        let (chunks, len) = (self.chunks, self.chunk_len);
        Ok(into_audio_stream(try_stream! {
            for _ in 0..chunks {
                yield Bytes::from(vec![1u8; len]);
            }
        }))
    }
}

pub fn test_config(llm_url: &str) -> ServerConfig {
    ServerConfig {
        rate_limit_per_minute: 6000,
        llm: LlmConfig {
            api_url: llm_url.to_string(),
            ..LlmConfig::default()
        },
        ..ServerConfig::default()
    }
}

/// App with `english` serving `en` and `hindi` (falling back to `english`)
/// serving `hi`.
pub fn create_test_app(
    llm_url: &str,
    english: Arc<FakeBackend>,
    hindi: Arc<FakeBackend>,
) -> Router {
    let router = BackendRouter::builder("en")
        .backend(english)
        .backend(hindi)
        .route("en", "english", &[])
        .route("hi", "hindi", &["english"])
        .build()
        .unwrap();
    let config = test_config(llm_url);
    let state = AppState::new(Arc::new(router), ChatClient::new(config.llm.clone()), config);
    build_router(state).unwrap()
}

pub fn default_app(llm_url: &str) -> Router {
    create_test_app(
        llm_url,
        Arc::new(FakeBackend::new("english", 2, 8)),
        Arc::new(FakeBackend::new("hindi", 2, 8)),
    )
}

/// Address nothing listens on.
pub const DEAD_LLM: &str = "http://127.0.0.1:9/v1/chat/completions";

pub fn sse_chunk(content: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
    )
}

/// Serves one scripted completion stream on an ephemeral port.
pub async fn mock_llm(deltas: &[&str]) -> String {
    let mut parts: Vec<String> = deltas.iter().map(|d| sse_chunk(d)).collect();
    parts.push("data: [DONE]\n\n".to_string());

    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(body): Json<serde_json::Value>| {
            let parts = parts.clone();
            async move {
                assert_eq!(body["stream"], true);
                assert_eq!(body["messages"][0]["role"], "system");
                let body = stream::iter(
                    parts.into_iter().map(|p| Ok::<_, Infallible>(Bytes::from(p))),
                );
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    Body::from_stream(body),
                )
                    .into_response()
            }
        }),
    );
    serve(app).await
}

/// Serves an LLM endpoint that always answers with `status`.
pub async fn failing_llm(status: u16) -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            let status = axum::http::StatusCode::from_u16(status).unwrap();
            (status, "upstream broke").into_response()
        }),
    );
    serve(app).await
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/v1/chat/completions")
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_bytes(response: Response) -> Bytes {
    to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
