//! # Gatekeeper: usage governance for generative AI APIs
//!
//! This crate gates and meters calls to a generative AI provider. Every
//! request runs through three cooperating components behind one facade:
//!
//! - A per-user, in-memory sliding-window rate limiter for hourly bursts
//! - A durable usage tracker enforcing daily and monthly quotas, backed by
//!   a local LibSQL database with atomic counter updates
//! - A generation client that prefers a primary provider (Gemini) and
//!   degrades to a fallback (OpenAI-compatible) when it fails
//!
//! ## Example
//!
//! ```rust,no_run
//! use gatekeeper::service::{AiRequest, AiService, AiServiceConfig};
//! use gatekeeper::tiers::Tier;
//! use gatekeeper::usage::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::new_from_path("usage.db").await?;
//!     let service = AiService::new(AiServiceConfig {
//!         gemini_api_key: Some("your-gemini-key".to_string()),
//!         openai_api_key: Some("your-openai-key".to_string()),
//!         db,
//!     })?;
//!
//!     let response = service
//!         .generate(&AiRequest {
//!             user_id: "user-123".to_string(),
//!             tier: Tier::Free,
//!             prompt: "Tell me a story about a robot.".to_string(),
//!         })
//!         .await;
//!
//!     if let Some(result) = response.result {
//!         println!("{}", result.text);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod limiter;

pub mod generation;
pub mod service;
pub mod tiers;
pub mod usage;

pub use error::{Error, Result};
pub use limiter::{RateLimitStatus, RateLimiter, RateLimiterStats};

/// Re-export of the types most callers need
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::generation::{GenerationClient, GenerationResult, Provider};
    pub use crate::limiter::RateLimiter;
    pub use crate::service::{AiRequest, AiResponse, AiService, AiServiceConfig};
    pub use crate::tiers::Tier;
    pub use crate::usage::{Database, QuotaScope, UsageTracker};
}
