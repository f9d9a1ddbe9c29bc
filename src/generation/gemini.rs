//! Primary text-generation provider (Gemini developer API)
//!
//! Thin REST client for `generateContent`, its SSE streaming variant, and
//! the token-count endpoint. Authentication is the API key passed as a
//! query parameter. There is no retry here: a 429 surfaces as
//! [`Error::RateLimit`] for the layers above to handle.

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use reqwest::{Client as ReqwestClient, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument};
use url::Url;

use crate::error::{Error, Result};

/// Default Gemini API endpoint
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// API version path segment
const API_VERSION: &str = "v1beta";

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Fallback retry delay when a 429 carries no Retry-After header
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// A piece of conversation content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    /// The role of the content (e.g. "user", "model")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// The parts that make up this content
    pub parts: Vec<Part>,
}

/// A text part of content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    /// Text content
    pub text: String,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

impl GenerateContentRequest {
    fn from_prompt(prompt: &str) -> Self {
        Self {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        }
    }
}

/// Token counts reported by the provider alongside a generation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    /// Tokens consumed by the prompt
    pub prompt_token_count: Option<u32>,

    /// Tokens produced across candidates
    pub candidates_token_count: Option<u32>,

    /// Total tokens for the call
    pub total_token_count: Option<u32>,
}

/// A candidate response from the model
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// The content of the candidate
    pub content: Option<Content>,

    /// Finish reason
    pub finish_reason: Option<String>,
}

/// Response from content generation (full or one streamed chunk)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    /// The generated candidates
    #[serde(default)]
    pub candidates: Vec<Candidate>,

    /// Token accounting, present on full responses and final stream chunks
    pub usage_metadata: Option<UsageMetadata>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate's parts
    pub fn text(&self) -> String {
        let Some(candidate) = self.candidates.first() else {
            return String::new();
        };
        let Some(content) = candidate.content.as_ref() else {
            return String::new();
        };
        content
            .parts
            .iter()
            .map(|part| part.text.as_str())
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct CountTokensRequest {
    contents: Vec<Content>,
}

/// Token count response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountTokensResponse {
    /// Total tokens counted
    pub total_tokens: u32,
}

/// HTTP client for the Gemini API
#[derive(Clone)]
pub struct GeminiClient {
    client: ReqwestClient,
    base_url: String,
    api_key: String,
}

#[cfg(test)]
impl GeminiClient {
    /// Set the base URL (for testing only)
    pub fn set_base_url(&mut self, url: String) {
        self.base_url = url;
    }
}

impl GeminiClient {
    /// Create a new client with an API key
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = ReqwestClient::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            base_url: GEMINI_API_BASE.to_string(),
            api_key: api_key.into(),
        })
    }

    fn build_url(&self, path: &str) -> Result<Url> {
        let url = format!("{}/{}/{}", self.base_url, API_VERSION, path);
        Url::parse(&url).map_err(|e| Error::Other(format!("Invalid URL: {}", e)))
    }

    /// Generate content from a model
    #[instrument(skip(self, prompt), level = "debug")]
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<GenerateContentResponse> {
        let url = self.build_url(&format!("models/{}:generateContent", model))?;
        let request = GenerateContentRequest::from_prompt(prompt);

        debug!("Generating content from model {}", model);
        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(Error::Http)?;

        parse_json_response(response).await
    }

    /// Stream generated content as server-sent events.
    ///
    /// Each yielded item is one chunk; the final chunk typically carries the
    /// usage metadata for the whole call.
    #[instrument(skip(self, prompt), level = "debug")]
    pub async fn generate_stream(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<impl Stream<Item = Result<GenerateContentResponse>>> {
        let url = self.build_url(&format!("models/{}:streamGenerateContent", model))?;
        let request = GenerateContentRequest::from_prompt(prompt);

        debug!("Streaming content from model {}", model);
        let response = self
            .client
            .post(url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let mut body = response.bytes_stream();
        Ok(try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(Error::Http)?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim_end_matches('\r').to_string();
                    buffer.drain(..=newline);

                    if let Some(data) = line.strip_prefix("data: ") {
                        let parsed: GenerateContentResponse =
                            serde_json::from_str(data).map_err(Error::Json)?;
                        yield parsed;
                    }
                }
            }
        })
    }

    /// Count tokens in a prompt using the provider's tokenizer
    #[instrument(skip(self, prompt), level = "debug")]
    pub async fn count_tokens(&self, model: &str, prompt: &str) -> Result<u32> {
        let url = self.build_url(&format!("models/{}:countTokens", model))?;
        let request = CountTokensRequest {
            contents: vec![Content {
                role: None,
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(Error::Http)?;

        let counted: CountTokensResponse = parse_json_response(response).await?;
        Ok(counted.total_tokens)
    }

    /// Check whether the configured key is accepted by the API.
    ///
    /// Returns `Ok(false)` on a clean rejection of the key; transport and
    /// server failures still surface as errors.
    #[instrument(skip(self), level = "debug")]
    pub async fn validate_key(&self) -> Result<bool> {
        let url = self.build_url("models")?;

        let response = self
            .client
            .get(url)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(Error::Http)?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Ok(false);
        }
        Err(error_from_response(response).await)
    }
}

/// Parse a JSON body out of a successful response, or triage the failure
async fn parse_json_response<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let body = response.text().await.map_err(Error::Http)?;
    serde_json::from_str(&body).map_err(|e| {
        error!("Failed to parse response: {}", e);
        Error::Other(format!("Unexpected response format: {}", e))
    })
}

/// Map a failed response to the crate error taxonomy
async fn error_from_response(response: Response) -> Error {
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
        return Error::RateLimit {
            retry_after_secs: retry_after,
        };
    }

    let body = response.text().await.unwrap_or_default();
    error!("API error: {} - {}", status, body);

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Error::Auth("Invalid API key or credentials".to_string())
    } else {
        Error::Api {
            status_code: status.as_u16(),
            message: body,
        }
    }
}
