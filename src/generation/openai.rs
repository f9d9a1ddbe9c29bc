//! Fallback text-generation provider (OpenAI-compatible chat completions)
//!
//! Only the non-streaming path exists here: streaming generation is served
//! by the primary provider exclusively, so the fallback stays a single
//! request/response call with bearer-token auth.

use reqwest::{Client as ReqwestClient, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument};
use url::Url;

use crate::error::{Error, Result};

/// Default OpenAI API endpoint
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Model used for every fallback generation, regardless of tier
pub const FALLBACK_MODEL: &str = "gpt-4o-mini";

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Fallback retry delay when a 429 carries no Retry-After header
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// One chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role ("user", "assistant", "system")
    pub role: String,

    /// Message text
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

/// Token accounting for a completion
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionUsage {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,

    /// Tokens produced by the completion
    pub completion_tokens: u32,

    /// Total tokens for the call
    pub total_tokens: u32,
}

/// One completion choice
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// The completion message
    pub message: ChatMessage,

    /// Finish reason
    pub finish_reason: Option<String>,
}

/// Response from a chat completion
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    /// The completion choices
    #[serde(default)]
    pub choices: Vec<Choice>,

    /// Token accounting
    pub usage: Option<CompletionUsage>,
}

impl ChatCompletionResponse {
    /// Text of the first choice
    pub fn text(&self) -> String {
        self.choices
            .first()
            .map(|choice| choice.message.content.clone())
            .unwrap_or_default()
    }
}

/// HTTP client for an OpenAI-compatible chat-completions API
#[derive(Clone)]
pub struct OpenAiClient {
    client: ReqwestClient,
    base_url: String,
    api_key: String,
}

#[cfg(test)]
impl OpenAiClient {
    /// Set the base URL (for testing only)
    pub fn set_base_url(&mut self, url: String) {
        self.base_url = url;
    }
}

impl OpenAiClient {
    /// Create a new client with an API key
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = ReqwestClient::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            base_url: OPENAI_API_BASE.to_string(),
            api_key: api_key.into(),
        })
    }

    fn build_url(&self, path: &str) -> Result<Url> {
        let url = format!("{}/{}", self.base_url, path);
        Url::parse(&url).map_err(|e| Error::Other(format!("Invalid URL: {}", e)))
    }

    /// Run one chat completion for a single-user prompt
    #[instrument(skip(self, prompt), level = "debug")]
    pub async fn chat(&self, model: &str, prompt: &str) -> Result<ChatCompletionResponse> {
        let url = self.build_url("chat/completions")?;
        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        debug!("Requesting chat completion from model {}", model);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(Error::Http)?;

        parse_json_response(response).await
    }
}

/// Parse a JSON body out of a successful response, or triage the failure
async fn parse_json_response<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

        let body = response.text().await.unwrap_or_default();
        error!("API error: {} - {}", status, body);
        return Err(Error::RateLimit {
            retry_after_secs: retry_after,
        });
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!("API error: {} - {}", status, body);

        return if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(Error::Auth("Invalid API key or credentials".to_string()))
        } else {
            Err(Error::Api {
                status_code: status.as_u16(),
                message: body,
            })
        };
    }

    let body = response.text().await.map_err(Error::Http)?;
    serde_json::from_str(&body).map_err(|e| {
        error!("Failed to parse response: {}", e);
        Error::Other(format!("Unexpected response format: {}", e))
    })
}
