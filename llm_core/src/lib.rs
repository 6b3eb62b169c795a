//! Streaming client for OpenAI-compatible chat completion endpoints.

pub mod language;
pub mod sse;

use std::env;
use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

pub use language::{default_system_prompt, detect_language, QueryBudget};
pub use sse::{SseDecoder, SseEvent};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("LLM did not finish within {0:?}")]
    Timeout(Duration),
}

/// Text fragments in the order the model produced them.
pub type TextDeltaStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

fn into_delta_stream<S>(stream: S) -> TextDeltaStream
where
    S: Stream<Item = Result<String, LlmError>> + Send + 'static,
{
    Box::pin(stream)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/v1/chat/completions".into(),
            model: "mistral-small".into(),
            api_key: None,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

impl LlmConfig {
    /// Reads `LLM_API_URL`, `LLM_MODEL`, `LLM_API_KEY` (or `OPENAI_API_KEY`),
    /// `LLM_TEMPERATURE` and `LLM_TOP_P`, keeping defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: env::var("LLM_API_URL").unwrap_or(defaults.api_url),
            model: env::var("LLM_MODEL").unwrap_or(defaults.model),
            api_key: env::var("LLM_API_KEY")
                .or_else(|_| env::var("OPENAI_API_KEY"))
                .ok()
                .filter(|k| !k.is_empty()),
            temperature: env::var("LLM_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.temperature),
            top_p: env::var("LLM_TOP_P")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.top_p),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

fn delta_content(data: &str) -> Option<String> {
    match serde_json::from_str::<ChunkBody>(data) {
        Ok(body) => body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty()),
        Err(e) => {
            debug!(error = %e, "skipping malformed stream chunk");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl ChatClient {
    pub fn new(config: LlmConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Starts a streamed completion and returns its text deltas.
    ///
    /// `budget.timeout` bounds the whole exchange, from sending the request
    /// to the last delta. Expiry ends the stream with [`LlmError::Timeout`].
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        budget: QueryBudget,
    ) -> Result<TextDeltaStream, LlmError> {
        let deadline = Instant::now() + budget.timeout;
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: budget.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            stream: true,
        };

        let mut request = self.client.post(&self.config.api_url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = timeout_at(deadline, request.send())
            .await
            .map_err(|_| LlmError::Timeout(budget.timeout))??;

        let status = response.status();
        if !status.is_success() {
            let body = timeout_at(deadline, response.text())
                .await
                .map_err(|_| LlmError::Timeout(budget.timeout))?
                .unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!(model = %self.config.model, max_tokens = budget.max_tokens, "LLM stream opened");
        let mut bytes = Box::pin(response.bytes_stream());
        let limit = budget.timeout;

        Ok(into_delta_stream(try_stream! {
            let mut decoder = SseDecoder::new();
            let mut done = false;
            while !done {
                let next = match timeout_at(deadline, bytes.next()).await {
                    Ok(next) => next,
                    Err(_) => Err::<_, LlmError>(LlmError::Timeout(limit))?,
                };
                let events = match next {
                    Some(chunk) => decoder.push(&chunk?),
                    None => {
                        done = true;
                        decoder.finish().into_iter().collect()
                    }
                };
                for event in events {
                    match event {
                        SseEvent::Done => {
                            done = true;
                            break;
                        }
                        SseEvent::Data(data) => {
                            if let Some(content) = delta_content(&data) {
                                yield content;
                            }
                        }
                    }
                }
            }
            debug!("LLM stream finished");
        }))
    }

    /// Collects a whole completion into one string.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        budget: QueryBudget,
    ) -> Result<String, LlmError> {
        let mut deltas = self.stream_chat(messages, budget).await?;
        let mut text = String::new();
        while let Some(delta) = deltas.next().await {
            text.push_str(&delta?);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_content() {
        let data = r#"{"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(delta_content(data), Some("Hi".into()));
        assert_eq!(delta_content(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#), None);
        assert_eq!(delta_content(r#"{"choices":[{"delta":{"content":""}}]}"#), None);
        assert_eq!(delta_content(r#"{"choices":[]}"#), None);
        assert_eq!(delta_content("not json"), None);
    }

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::system("be brief");
        assert_eq!(msg.role, "system");
        assert_eq!(ChatMessage::user("hi").role, "user");
        assert_eq!(ChatMessage::assistant("hello").content, "hello");
    }

    #[test]
    fn test_request_shape() {
        let messages = [ChatMessage::user("hi")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            max_tokens: 150,
            temperature: 0.7,
            top_p: 0.9,
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["max_tokens"], 150);
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
