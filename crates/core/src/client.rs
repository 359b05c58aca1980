use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use crate::error::{PipelineError, Result};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Rough per-message framing overhead added to the prompt estimate.
const MESSAGE_OVERHEAD_TOKENS: usize = 16;

/// Conventional ~4 characters per token approximation.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Context-window limits per model. Unknown models get the smallest current
/// window so the budget check stays conservative.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: String,
    pub context_window: usize,
}

impl ModelSpec {
    pub fn lookup(name: &str) -> Self {
        let context_window = match name {
            "gpt-4o" | "gpt-4o-mini" | "gpt-4.1" | "gpt-4.1-mini" => 128_000,
            "gpt-4-turbo" => 128_000,
            "gpt-3.5-turbo" => 16_385,
            _ => 16_385,
        };
        Self {
            name: name.to_string(),
            context_window,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_response_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// The wire layer under `RateLimitedClient`, swappable in tests.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// Chat-completions call over HTTPS with bearer auth.
pub struct HttpChatTransport {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

pub const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpChatTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: CHAT_COMPLETIONS_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": request.model,
                "messages": [
                    { "role": "system", "content": request.system },
                    { "role": "user", "content": request.user },
                ],
                "max_tokens": request.max_response_tokens,
                "temperature": 0.3,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        let parsed: ChatCompletionsResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::BadResponse {
                reason: "response contained no choices".to_string(),
            })?;

        Ok(ChatResponse {
            text: choice.message.content,
            usage: parsed.usage.unwrap_or_default(),
        })
    }
}

/// Map an HTTP error status to the retry taxonomy: rate limits and server
/// errors may clear up, everything else (auth, malformed request) will not.
pub fn status_error(status: u16, body: &str) -> PipelineError {
    let reason = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.chars().take(200).collect::<String>())
    };
    if status == 429 || (500..=599).contains(&status) {
        PipelineError::TransientApi { reason }
    } else {
        PipelineError::FatalApi { status, reason }
    }
}

/// Wraps a `ChatTransport` with minimum inter-request pacing, bounded retry
/// with exponential backoff on transient failures, and a pre-send token
/// budget check against the model's context window.
pub struct RateLimitedClient<T: ChatTransport> {
    transport: T,
    spec: ModelSpec,
    request_delay: Duration,
    max_retries: u32,
    last_request: Option<Instant>,
}

impl<T: ChatTransport> RateLimitedClient<T> {
    pub fn new(transport: T, spec: ModelSpec, request_delay: Duration, max_retries: u32) -> Self {
        Self {
            transport,
            spec,
            request_delay,
            max_retries,
            last_request: None,
        }
    }

    pub fn model(&self) -> &str {
        &self.spec.name
    }

    /// Send one prompt. Fails with `TokenBudgetExceeded` before any network
    /// traffic when the estimate does not fit the model's window.
    pub async fn request(
        &mut self,
        system: &str,
        user: &str,
        max_response_tokens: u32,
    ) -> Result<(String, TokenUsage)> {
        let estimated = estimate_tokens(system)
            + estimate_tokens(user)
            + 2 * MESSAGE_OVERHEAD_TOKENS
            + max_response_tokens as usize;
        if estimated > self.spec.context_window {
            return Err(PipelineError::TokenBudgetExceeded {
                model: self.spec.name.clone(),
                estimated,
                limit: self.spec.context_window,
            });
        }

        let request = ChatRequest {
            model: self.spec.name.clone(),
            system: system.to_string(),
            user: user.to_string(),
            max_response_tokens,
        };

        let mut attempt: u32 = 0;
        loop {
            self.pace().await;
            match self.transport.send(&request).await {
                Ok(response) => return Ok((response.text, response.usage)),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "transient API error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn pace(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.request_delay {
                tokio::time::sleep(self.request_delay - elapsed).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}

/// Exponential backoff with ±20% jitter so herds of retries spread out.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_millis() as u64 * 2u64.pow(attempt.min(8));
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}
