//! LLM client — the single point of entry for completion-model calls.
//!
//! ARCHITECTURAL RULE: no other module may call the model API directly; the
//! generator goes through `CompletionModel::complete`. Model calls are
//! reserved for unstructured text work (the email body), never for
//! control-flow decisions, which stay deterministic in the mediator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod prompts;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
/// Hardcoded to prevent accidental model drift between deployments.
pub const MODEL: &str = "claude-sonnet-4-5";
const MAX_TOKENS: u32 = 1024;
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("gave up after {retries} retries")]
    RetriesExhausted { retries: u32 },

    #[error("model returned empty content")]
    EmptyContent,
}

/// Completion collaborator seam. The production implementation is
/// `LlmClient`; tests substitute deterministic stubs.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, prompt: &str, system: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [UserMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Thin client for the Anthropic Messages API with bounded retry on
/// rate-limit and server errors.
#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
        }
    }

    async fn call_once(&self, prompt: &str, system: &str) -> Result<MessagesResponse, LlmError> {
        let request = MessagesRequest {
            model: MODEL,
            max_tokens: MAX_TOKENS,
            system,
            messages: [UserMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl CompletionModel for LlmClient {
    /// Returns the first text block of the model response. Retries 429 and
    /// 5xx responses with exponential backoff (1s, 2s, 4s).
    async fn complete(&self, prompt: &str, system: &str) -> Result<String, LlmError> {
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!("LLM call retry {attempt} after {}ms", delay.as_millis());
                tokio::time::sleep(delay).await;
            }

            let response = match self.call_once(prompt, system).await {
                Ok(r) => r,
                Err(LlmError::Api { status, message }) if status == 429 || status >= 500 => {
                    warn!("LLM API returned {status}: {message}");
                    continue;
                }
                Err(LlmError::Http(e)) => {
                    warn!("LLM HTTP error: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            debug!(
                "LLM call succeeded: input_tokens={}, output_tokens={}",
                response.usage.input_tokens, response.usage.output_tokens
            );

            return response
                .content
                .into_iter()
                .find(|b| b.block_type == "text")
                .and_then(|b| b.text)
                .filter(|t| !t.trim().is_empty())
                .ok_or(LlmError::EmptyContent);
        }

        Err(LlmError::RetriesExhausted {
            retries: MAX_RETRIES,
        })
    }
}
