//! Answer generation through an OpenAI-compatible chat completions API.
//!
//! [`ModelId`] is the fixed catalog of models callers may pick from.
//! [`GenerationProvider`] is the seam between the orchestrator and the
//! remote service; [`ChatCompletionsClient`] implements it over HTTP
//! (Groq by default). [`generate_with_retry`] applies the retry policy.
//!
//! # Retry Policy
//!
//! | Error | Handling |
//! |-------|----------|
//! | `RateLimited` | exponential backoff, up to `max_retries` retries |
//! | `Timeout` | retried once |
//! | anything else | returned immediately |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::GenerationError;

// ============ Model Catalog ============

/// Models accepted by the generation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModelId {
    #[default]
    Llama33Versatile,
    Llama31Instant,
    Llama4Scout,
    Qwen3,
    GptOss20b,
}

impl ModelId {
    pub fn all() -> &'static [ModelId] {
        &[
            ModelId::Llama33Versatile,
            ModelId::Llama31Instant,
            ModelId::Llama4Scout,
            ModelId::Qwen3,
            ModelId::GptOss20b,
        ]
    }

    /// Provider-side model name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelId::Llama33Versatile => "llama-3.3-70b-versatile",
            ModelId::Llama31Instant => "llama-3.1-8b-instant",
            ModelId::Llama4Scout => "meta-llama/llama-4-scout-17b-16e-instruct",
            ModelId::Qwen3 => "qwen/qwen3-32b",
            ModelId::GptOss20b => "openai/gpt-oss-20b",
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            ModelId::Llama33Versatile => "Llama 3.3 70B Versatile",
            ModelId::Llama31Instant => "Llama 3.1 8B Instant",
            ModelId::Llama4Scout => "Llama 4 Scout 17B",
            ModelId::Qwen3 => "Qwen3 32B",
            ModelId::GptOss20b => "GPT-OSS 20B",
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelId {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ModelId::all()
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| GenerationError::UnknownModel(s.to_string()))
    }
}

// ============ Provider Trait ============

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: ModelId,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generate the answer text for `request`.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

// ============ Chat Completions Client ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// OpenAI-compatible `POST {base_url}/chat/completions` client.
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl ChatCompletionsClient {
    /// Build a client from config. The API key is read from
    /// `generation.api_key_env`; a missing key surfaces as `AuthFailure`
    /// on first use.
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            tracing::debug!(env = %config.api_key_env, "generation API key not set");
        }
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    async fn send(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            GenerationError::AuthFailure("no API key configured".to_string())
        })?;

        let body = ChatRequest {
            model: request.model.as_str(),
            messages: vec![
                ChatMessage::system(&request.system_prompt),
                ChatMessage::user(&request.user_prompt),
            ],
            temperature: request.temperature,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout
                } else {
                    GenerationError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &text, request.model));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GenerationError::InvalidResponse("no choices returned".to_string()))
    }
}

#[async_trait]
impl GenerationProvider for ChatCompletionsClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        match tokio::time::timeout(self.timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout),
        }
    }
}

/// Map a non-success HTTP status to a [`GenerationError`].
fn map_status(status: u16, body: &str, model: ModelId) -> GenerationError {
    let detail = format!("HTTP {}: {}", status, body.trim());
    match status {
        429 => GenerationError::RateLimited(detail),
        401 | 403 => GenerationError::AuthFailure(detail),
        404 => GenerationError::UnknownModel(model.as_str().to_string()),
        408 | 504 => GenerationError::Timeout,
        _ if body.contains("model_not_found") => {
            GenerationError::UnknownModel(model.as_str().to_string())
        }
        _ => GenerationError::NetworkError(detail),
    }
}

// ============ Retry ============

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1 << attempt.saturating_sub(1).min(5))
    }
}

/// Call `provider`, retrying rate limits with backoff and timeouts once.
pub async fn generate_with_retry(
    provider: &dyn GenerationProvider,
    request: &GenerationRequest,
    policy: RetryPolicy,
) -> Result<String, GenerationError> {
    let mut rate_limit_retries = 0u32;
    let mut timeout_retried = false;

    loop {
        match provider.generate(request).await {
            Ok(text) => return Ok(text),
            Err(GenerationError::RateLimited(msg)) if rate_limit_retries < policy.max_retries => {
                rate_limit_retries += 1;
                let delay = policy.delay(rate_limit_retries);
                tracing::warn!(
                    model = %request.model,
                    attempt = rate_limit_retries,
                    delay_ms = delay.as_millis() as u64,
                    reason = %msg,
                    "rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(GenerationError::Timeout) if !timeout_retried => {
                timeout_retried = true;
                tracing::warn!(model = %request.model, "generation timed out, retrying once");
            }
            Err(e) => return Err(e),
        }
    }
}
