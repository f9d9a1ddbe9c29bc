//! Per-user request throttling over a trailing one-hour window
//!
//! The limiter keeps an in-memory list of request instants per user and
//! prunes it against the window on every inspection. State is process-local:
//! restarting the process clears all windows, and horizontally-scaled
//! deployments each enforce their own independent window. Callers that need
//! a hard global cap should treat this as a soft limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::tiers::Tier;

/// Trailing window over which hourly limits are enforced
const WINDOW: Duration = Duration::from_secs(3600);

/// How often the global sweep over all users runs (checked opportunistically)
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Reporting view of one user's window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Requests allowed per hour for the user's tier
    pub limit: u32,

    /// Requests recorded within the trailing hour
    pub used: u32,

    /// Requests still available within the trailing hour
    pub remaining: u32,

    /// Unix timestamp at which the oldest recorded request leaves the window
    pub resets_at: u64,
}

/// Aggregate view over all tracked users
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Users with at least one request in the window
    pub users: usize,

    /// Total requests recorded across all users' windows
    pub requests_in_window: usize,
}

#[derive(Debug, Default)]
struct UserWindow {
    requests: VecDeque<Instant>,
}

struct LimiterState {
    windows: HashMap<String, UserWindow>,
    last_sweep: Instant,
}

impl LimiterState {
    /// Sweep every user's window if the sweep interval has elapsed,
    /// evicting users whose windows empty out.
    fn sweep_if_due(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;

        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(&mut window.requests, now);
            !window.requests.is_empty()
        });

        let evicted = before - self.windows.len();
        if evicted > 0 {
            debug!(evicted, tracked = self.windows.len(), "swept rate limit windows");
        }
    }
}

/// Remove timestamps that have aged out of the trailing window
fn prune(requests: &mut VecDeque<Instant>, now: Instant) {
    while let Some(timestamp) = requests.front() {
        if now.duration_since(*timestamp) >= WINDOW {
            requests.pop_front();
        } else {
            break;
        }
    }
}

/// Seconds until the oldest recorded request leaves the window, rounded up
fn retry_after_secs(oldest: Instant, now: Instant) -> u64 {
    let remaining = WINDOW.saturating_sub(now.duration_since(oldest));
    remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
}

/// In-memory sliding-window rate limiter keyed by user
///
/// Construct one per process and hand it to whatever composes the call path;
/// cloning shares the underlying state. Keeping the limiter an owned value
/// rather than a global lets tests build fresh instances and lets a
/// deployment swap in a shared-store implementation behind the same surface.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<LimiterState>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a limiter with no recorded requests
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                windows: HashMap::new(),
                last_sweep: Instant::now(),
            })),
        }
    }

    /// Check the user's window and record the request if it is admitted.
    ///
    /// Admission consumes one slot, so this must be called exactly once per
    /// actual attempt. Use [`RateLimiter::can_make_request`] for a read-only
    /// pre-check.
    pub async fn check(&self, user_id: &str, tier: Tier) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.sweep_if_due(now);

        let window = state.windows.entry(user_id.to_string()).or_default();
        prune(&mut window.requests, now);

        let limit = tier.queries_per_hour();
        if window.requests.len() >= limit as usize {
            // Window is full; the caller can retry once the oldest entry ages out.
            let oldest = *window
                .requests
                .front()
                .ok_or_else(|| Error::Other("rate limit window emptied under lock".to_string()))?;
            let retry_after = retry_after_secs(oldest, now);
            debug!(user_id, limit, retry_after, "rate limit exceeded");
            return Err(Error::RateLimit {
                retry_after_secs: retry_after,
            });
        }

        window.requests.push_back(now);
        Ok(())
    }

    /// Read-only variant of [`RateLimiter::check`]: reports whether a request
    /// would currently be admitted without consuming a slot.
    pub async fn can_make_request(&self, user_id: &str, tier: Tier) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.sweep_if_due(now);

        match state.windows.get_mut(user_id) {
            Some(window) => {
                prune(&mut window.requests, now);
                window.requests.len() < tier.queries_per_hour() as usize
            }
            None => true,
        }
    }

    /// Snapshot of the user's window for reporting
    pub async fn status(&self, user_id: &str, tier: Tier) -> RateLimitStatus {
        let now = Instant::now();
        let unix_now = unix_timestamp();
        let mut state = self.state.lock().await;
        state.sweep_if_due(now);

        let limit = tier.queries_per_hour();
        let (used, resets_at) = match state.windows.get_mut(user_id) {
            Some(window) => {
                prune(&mut window.requests, now);
                let resets_at = match window.requests.front() {
                    Some(oldest) => unix_now + retry_after_secs(*oldest, now),
                    None => unix_now,
                };
                (window.requests.len() as u32, resets_at)
            }
            None => (0, unix_now),
        };

        RateLimitStatus {
            limit,
            used,
            remaining: limit.saturating_sub(used),
            resets_at,
        }
    }

    /// Drop all recorded requests for one user
    pub async fn reset(&self, user_id: &str) {
        let mut state = self.state.lock().await;
        state.windows.remove(user_id);
    }

    /// Drop all recorded requests for every user
    pub async fn clear_all(&self) {
        let mut state = self.state.lock().await;
        state.windows.clear();
    }

    /// Aggregate counts across all tracked users, pruning as it goes
    pub async fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        state.windows.retain(|_, window| {
            prune(&mut window.requests, now);
            !window.requests.is_empty()
        });

        RateLimiterStats {
            users: state.windows.len(),
            requests_in_window: state.windows.values().map(|w| w.requests.len()).sum(),
        }
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
