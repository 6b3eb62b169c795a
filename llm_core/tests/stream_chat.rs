use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures::{stream, StreamExt};
use llm_core::{ChatClient, ChatMessage, LlmConfig, LlmError, QueryBudget};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/v1/chat/completions")
}

fn client(url: String) -> ChatClient {
    ChatClient::new(LlmConfig {
        api_url: url,
        ..LlmConfig::default()
    })
}

fn chunk(content: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
    )
}

fn event_stream(parts: Vec<String>) -> Response {
    let body = stream::iter(parts.into_iter().map(|p| Ok::<_, Infallible>(Bytes::from(p))));
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

fn budget(timeout: Duration) -> QueryBudget {
    QueryBudget {
        max_tokens: 50,
        timeout,
    }
}

#[tokio::test]
async fn test_streams_deltas_until_done() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|Json(body): Json<serde_json::Value>| async move {
            assert_eq!(body["stream"], true);
            assert_eq!(body["max_tokens"], 50);
            assert_eq!(body["model"], "mistral-small");
            event_stream(vec![
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n".into(),
                chunk("Hello"),
                chunk(" there."),
                "data: not json\n\n".into(),
                chunk(" Bye."),
                "data: [DONE]\n\n".into(),
                chunk("never"),
            ])
        }),
    );
    let client = client(serve(app).await);

    let messages = [ChatMessage::system("be brief"), ChatMessage::user("hi")];
    let deltas: Vec<String> = client
        .stream_chat(&messages, budget(Duration::from_secs(5)))
        .await
        .unwrap()
        .map(|d| d.unwrap())
        .collect()
        .await;

    assert_eq!(deltas, vec!["Hello", " there.", " Bye."]);
}

#[tokio::test]
async fn test_error_status() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "model loading") }),
    );
    let client = client(serve(app).await);

    let result = client
        .stream_chat(&[ChatMessage::user("hi")], budget(Duration::from_secs(5)))
        .await;
    match result {
        Err(LlmError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "model loading");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected an error status"),
    }
}

#[tokio::test]
async fn test_stalled_stream_times_out() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let first = stream::iter([Ok::<_, Infallible>(Bytes::from(chunk("Partial")))]);
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(first.chain(stream::pending())),
            )
        }),
    );
    let client = client(serve(app).await);

    let mut deltas = client
        .stream_chat(&[ChatMessage::user("hi")], budget(Duration::from_millis(300)))
        .await
        .unwrap();

    assert_eq!(deltas.next().await.unwrap().unwrap(), "Partial");
    assert!(matches!(deltas.next().await, Some(Err(LlmError::Timeout(_)))));
    assert!(deltas.next().await.is_none());
}

#[tokio::test]
async fn test_complete_joins_deltas() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { event_stream(vec![chunk("One"), chunk(" two"), "data: [DONE]\n".into()]) }),
    );
    let client = client(serve(app).await);

    let text = client
        .complete(&[ChatMessage::user("count")], budget(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(text, "One two");
}
