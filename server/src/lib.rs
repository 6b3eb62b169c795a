//! HTTP surface for the streaming speech pipeline.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod validation;

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use llm_core::ChatClient;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer,
};
use tower_http::{
    cors::CorsLayer, limit::RequestBodyLimitLayer, map_response_body::MapResponseBodyLayer,
    timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{info, warn};
use tts_core::BackendRouter;

use crate::config::ServerConfig;
use crate::handlers::{
    health_check, list_voices, metrics_endpoint, speak_stream, stream_text, text_endpoint,
    tts_endpoint, voice_stream, voice_text,
};
use crate::metrics::AppMetrics;

/// Request bodies are small JSON documents; text is capped at 5000 characters.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<BackendRouter>,
    pub llm: ChatClient,
    pub metrics: AppMetrics,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(router: Arc<BackendRouter>, llm: ChatClient, config: ServerConfig) -> Self {
        Self {
            router,
            llm,
            metrics: AppMetrics::new(),
            config: Arc::new(config),
        }
    }

    /// Loads the voice map and builds every backend and client it names.
    pub fn from_config(config: ServerConfig) -> anyhow::Result<Self> {
        let map = config.load_voice_map()?;
        let client = reqwest::Client::new();
        let router = BackendRouter::from_voice_map(&map, config.normalizer(), client.clone())?;
        info!(
            languages = ?router.languages(),
            default = router.default_language(),
            "speech routes ready"
        );
        let llm = ChatClient::with_client(client, config.llm.clone());
        Ok(Self::new(Arc::new(router), llm, config))
    }
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/voices", get(list_voices))
        .route("/text", post(text_endpoint))
        .route("/tts", post(tts_endpoint))
        .route("/voice/text", post(voice_text))
        .route("/voice/stream", post(voice_stream))
        .route("/speak/stream", post(speak_stream))
        .route("/stream/text", post(stream_text))
        .route("/metrics", get(metrics_endpoint))
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_credentials(false);

    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .flatten()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins");
        base.allow_origin(tower_http::cors::Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        base.allow_origin(tower_http::cors::AllowOrigin::list(origins))
    }
}

/// Tags every request and response with an `x-request-id`, keeping one the
/// client already sent.
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok());

    if let Some(id) = &request_id {
        request.headers_mut().insert("x-request-id", id.clone());
    }
    let mut response = next.run(request).await;
    if let Some(id) = request_id {
        response.headers_mut().insert("x-request-id", id);
    }
    response
}

/// Every route at the root and under `/api`, behind tracing, a global rate
/// limit, a response-header timeout, a body size cap and CORS.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let config = state.config.clone();

    let rate = config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(u64::from(60_000 / rate).max(1))
            .burst_size(rate)
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", rate);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(MapResponseBodyLayer::new(axum::body::Body::new))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors_layer(&config))
        .into_inner();

    let api = api_routes();
    Ok(Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}
