//! Single entry point composing throttling, quota accounting, and generation
//!
//! [`AiService`] runs every request through the same strict order: the
//! cheap in-memory rate-limit check first, then the durable usage check,
//! then the provider call, and finally the usage increment. Typed internal
//! errors stop at this boundary; callers always receive an [`AiResponse`]
//! with a tagged error instead of a crate error.

use std::collections::VecDeque;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::generation::{GenerationClient, GenerationResult};
use crate::limiter::RateLimiter;
use crate::tiers::Tier;
use crate::usage::{Database, QuotaScope, UsageTracker};

/// Configuration bundle for building an [`AiService`]
pub struct AiServiceConfig {
    /// API key for the primary provider, if any
    pub gemini_api_key: Option<String>,

    /// API key for the fallback provider, if any
    pub openai_api_key: Option<String>,

    /// Initialized usage database
    pub db: Database,
}

/// One generation request
#[derive(Debug, Clone)]
pub struct AiRequest {
    /// Opaque user identifier
    pub user_id: String,

    /// The user's subscription tier
    pub tier: Tier,

    /// The raw prompt
    pub prompt: String,
}

/// Caller-facing error, tagged with the failure taxonomy
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AiError {
    /// Hourly sliding-window cap exceeded
    RateLimit {
        /// Human-readable description
        message: String,
        /// Seconds to wait before retrying
        retry_after: u64,
    },

    /// Daily or monthly quota exhausted
    UsageLimit {
        /// Human-readable description
        message: String,
        /// Which quota window was exhausted
        scope: QuotaScope,
        /// When the window rolls over (RFC 3339)
        resets_at: String,
    },

    /// Prompt rejected before any provider was contacted; never retried
    Validation {
        /// Human-readable description
        message: String,
    },

    /// Every configured provider failed
    Generation {
        /// Human-readable description
        message: String,
    },

    /// Anything uncategorized
    Unknown {
        /// Human-readable description
        message: String,
    },
}

impl From<Error> for AiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::RateLimit { retry_after_secs } => AiError::RateLimit {
                message,
                retry_after: retry_after_secs,
            },
            Error::UsageLimit { scope, resets_at } => AiError::UsageLimit {
                message,
                scope,
                resets_at,
            },
            Error::Validation(_) => AiError::Validation { message },
            Error::Generation(_) => AiError::Generation { message },
            _ => AiError::Unknown { message },
        }
    }
}

/// Remaining quota reported alongside a successful response
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    /// Requests available in the current calendar day
    pub daily_remaining: u32,

    /// Requests available in the current calendar month
    pub monthly_remaining: u32,
}

/// Outcome of one facade call
#[derive(Debug, Clone, Serialize)]
pub struct AiResponse {
    /// Whether the request produced a result
    pub success: bool,

    /// The generation result, on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,

    /// Remaining quota after the request, on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,

    /// The failure, tagged by type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AiError>,
}

impl AiResponse {
    fn ok(result: GenerationResult, usage: UsageSummary) -> Self {
        Self {
            success: true,
            result: Some(result),
            usage: Some(usage),
            error: None,
        }
    }

    fn err(error: Error) -> Self {
        Self {
            success: false,
            result: None,
            usage: None,
            error: Some(error.into()),
        }
    }
}

/// Pre-flight availability report
#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    /// Whether a request would currently be admitted
    pub available: bool,

    /// Why not, when unavailable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Remaining quota, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
}

/// Options for batch processing
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// How many requests run concurrently per batch
    pub max_concurrent: usize,

    /// Re-queue members that fail with a rate limit instead of reporting them
    pub retry_on_rate_limit: bool,

    /// Extra delay added on top of the limiter's retry-after, in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            retry_on_rate_limit: false,
            retry_delay_ms: 1_000,
        }
    }
}

/// Facade over the rate limiter, usage tracker, and generation client
#[derive(Clone)]
pub struct AiService {
    limiter: RateLimiter,
    tracker: UsageTracker,
    generator: GenerationClient,
}

impl AiService {
    /// Build a service from a configuration bundle
    pub fn new(config: AiServiceConfig) -> Result<Self> {
        Ok(Self {
            limiter: RateLimiter::new(),
            tracker: UsageTracker::new(config.db),
            generator: GenerationClient::new(config.gemini_api_key, config.openai_api_key)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_parts(
        limiter: RateLimiter,
        tracker: UsageTracker,
        generator: GenerationClient,
    ) -> Self {
        Self {
            limiter,
            tracker,
            generator,
        }
    }

    /// The rate limiter backing this service, for administrative access
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The usage tracker backing this service, for administrative access
    pub fn tracker(&self) -> &UsageTracker {
        &self.tracker
    }

    /// Run one request through the full governed path.
    ///
    /// Order is deliberate: the in-memory rate-limit check and the usage
    /// check run before the provider call so exhausted callers fail fast,
    /// and the usage increment lands only after a successful generation.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, tier = %request.tier), level = "debug")]
    pub async fn generate(&self, request: &AiRequest) -> AiResponse {
        match self.try_generate(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("request rejected: {}", e);
                AiResponse::err(e)
            }
        }
    }

    async fn try_generate(&self, request: &AiRequest) -> Result<AiResponse> {
        self.limiter.check(&request.user_id, request.tier).await?;
        self.tracker.check(&request.user_id, request.tier).await?;

        let result = self.generator.generate(&request.prompt, request.tier).await?;

        let usage = self.tracker.increment(&request.user_id, request.tier).await?;
        Ok(AiResponse::ok(
            result,
            UsageSummary {
                daily_remaining: usage.daily_remaining,
                monthly_remaining: usage.monthly_remaining,
            },
        ))
    }

    /// Process a queue of requests in fixed-size concurrent batches.
    ///
    /// Members that fail with a rate limit are re-queued after a sleep when
    /// `retry_on_rate_limit` is set; every other outcome goes straight to
    /// the result list. The retry loop has no cap: a member that never
    /// clears the limiter keeps the call alive indefinitely. Exactly one
    /// response is returned per input request; order is not guaranteed.
    #[instrument(skip(self, requests, options), fields(requests = requests.len()), level = "debug")]
    pub async fn generate_batch(
        &self,
        requests: Vec<AiRequest>,
        options: &BatchOptions,
    ) -> Vec<AiResponse> {
        let batch_size = options.max_concurrent.max(1);
        let mut queue: VecDeque<AiRequest> = requests.into();
        let mut responses = Vec::with_capacity(queue.len());

        while !queue.is_empty() {
            let take = batch_size.min(queue.len());
            let batch: Vec<AiRequest> = queue.drain(..take).collect();
            let outcomes = join_all(batch.iter().map(|request| self.generate(request))).await;

            // Sleeps for this pass's rate-limited members are coalesced into
            // one wait sized by the slowest member.
            let mut retry_wait_ms: Option<u64> = None;

            for (request, response) in batch.into_iter().zip(outcomes) {
                let retry_after = match (&response.error, options.retry_on_rate_limit) {
                    (Some(AiError::RateLimit { retry_after, .. }), true) => Some(*retry_after),
                    _ => None,
                };

                match retry_after {
                    Some(retry_after) => {
                        let wait = retry_after * 1_000 + options.retry_delay_ms;
                        retry_wait_ms = Some(retry_wait_ms.unwrap_or(0).max(wait));
                        warn!(
                            user_id = %request.user_id,
                            retry_after,
                            "batch member rate limited, re-queueing"
                        );
                        queue.push_back(request);
                    }
                    None => responses.push(response),
                }
            }

            if let Some(wait) = retry_wait_ms {
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
        }

        responses
    }

    /// Read-only pre-flight check: would a request currently be admitted?
    ///
    /// Consumes neither a rate-limit slot nor quota; intended for UI
    /// warnings before the user commits to a request.
    pub async fn check_availability(&self, user_id: &str, tier: Tier) -> Result<Availability> {
        if !self.limiter.can_make_request(user_id, tier).await {
            return Ok(Availability {
                available: false,
                reason: Some("hourly rate limit reached".to_string()),
                usage: None,
            });
        }

        let status = self.tracker.status(user_id, tier).await?;
        let usage = UsageSummary {
            daily_remaining: status.daily_remaining,
            monthly_remaining: status.monthly_remaining,
        };

        if !status.allowed {
            let reason = if status.daily_remaining == 0 {
                "daily quota exhausted"
            } else {
                "monthly quota exhausted"
            };
            return Ok(Availability {
                available: false,
                reason: Some(reason.to_string()),
                usage: Some(usage),
            });
        }

        Ok(Availability {
            available: true,
            reason: None,
            usage: Some(usage),
        })
    }
}
