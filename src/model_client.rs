//! The upstream chat-completion client abstraction.
//!
//! [`ModelClient`] is the one external collaborator this crate treats as
//! abstract: a single operation, stateless, safe to share behind
//! `Arc<dyn ModelClient>` across concurrent calls. [`OpenRouterClient`] is
//! the one concrete implementation, shaped around OpenRouter's chat
//! completions endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CouncilError;

/// A single chat message sent to the upstream model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Token accounting returned alongside a successful call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A successful upstream reply.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub content: String,
    pub usage: TokenUsage,
    /// Wall-clock duration of the call, used for the Response record.
    pub duration: Duration,
}

/// Trait-driven abstraction for a concrete upstream chat-completion
/// provider. Implementations must be `Send + Sync` so they can be shared
/// across concurrently spawned fan-out tasks.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// One-shot chat call. `timeout` bounds the whole request; the
    /// implementation does not retry internally — retries are the
    /// resilience layer's concern.
    async fn call(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        temperature: Option<f32>,
        timeout: Duration,
    ) -> Result<ModelReply, CouncilError>;
}

/// OpenRouter-shaped implementation of [`ModelClient`]: one HTTP POST to the
/// chat completions endpoint with a bearer token and an identifying
/// referrer/title header pair.
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    referrer: String,
    title: String,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        OpenRouterClient {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            referrer: "https://github.com/CloudLLM-ai/cloudllm".to_string(),
            title: "council-engine".to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let mut client = Self::new(api_key);
        client.endpoint = endpoint.into();
        client
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatCompletionUsage {
    #[serde(default, rename = "prompt_tokens")]
    prompt_tokens: u64,
    #[serde(default, rename = "completion_tokens")]
    completion_tokens: u64,
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn call(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        temperature: Option<f32>,
        timeout: Duration,
    ) -> Result<ModelReply, CouncilError> {
        let body = ChatCompletionRequest {
            model: model_id,
            messages,
            temperature,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referrer)
            .header("X-Title", &self.title)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify_transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), detail));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|err| {
            CouncilError::MalformedResponse {
                detail: err.to_string(),
            }
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CouncilError::MalformedResponse {
                detail: "response contained no choices".to_string(),
            })?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ModelReply {
            content,
            usage,
            duration: started.elapsed(),
        })
    }
}

fn classify_transport_error(err: &reqwest::Error) -> CouncilError {
    if err.is_timeout() {
        CouncilError::TransportTimeout {
            detail: err.to_string(),
        }
    } else {
        CouncilError::Unexpected {
            detail: err.to_string(),
        }
    }
}

fn classify_http_status(status: u16, detail: String) -> CouncilError {
    match status {
        401 | 403 => CouncilError::Unauthorized { detail },
        429 => CouncilError::RateLimited { detail },
        402 => CouncilError::QuotaExceeded { detail },
        _ => CouncilError::HttpStatus { status, detail },
    }
}
