//! Error types for the gatekeeper crate

use thiserror::Error;

use crate::usage::QuotaScope;

/// Result type for gatekeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gatekeeper operations
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {status_code} - {message}")]
    Api {
        /// HTTP status code
        status_code: u16,
        /// Error message
        message: String,
    },

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded. Please retry after {retry_after_secs} seconds")]
    RateLimit {
        /// Seconds to wait before retrying
        retry_after_secs: u64,
    },

    /// Daily or monthly usage quota exhausted
    #[error("{scope} usage limit reached. Quota resets at {resets_at}")]
    UsageLimit {
        /// Which quota window was exhausted
        scope: QuotaScope,
        /// When the exhausted window rolls over (RFC 3339)
        resets_at: String,
    },

    /// Prompt rejected before any provider was contacted
    #[error("Invalid prompt: {0}")]
    Validation(String),

    /// Every configured provider failed to generate
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Missing or inconsistent client configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}
