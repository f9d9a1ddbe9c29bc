//! Durable usage accounting
//!
//! This module provides the persistent side of usage governance: per-user
//! daily and monthly counters with calendar rollover, stored in a local
//! libsql database and mutated through atomic in-place updates.

mod database;
pub mod error;
mod schema;
mod tracker;

pub use database::Database;
pub use error::DbError;
pub use tracker::{UsageStats, UsageTracker};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tiers::Tier;

/// Which quota window an operation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaScope {
    /// Calendar-day window
    Daily,
    /// Calendar-month window
    Monthly,
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaScope::Daily => f.write_str("daily"),
            QuotaScope::Monthly => f.write_str("monthly"),
        }
    }
}

/// One user's persistent usage row
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    /// Opaque user identifier, unique key
    pub user_id: String,

    /// Subscription tier recorded for the user
    pub tier: Tier,

    /// Requests consumed in the current calendar day
    pub daily_used: u32,

    /// Requests consumed in the current calendar month
    pub monthly_used: u32,

    /// Day watermark (`YYYY-MM-DD`) the daily counter belongs to
    pub last_reset_daily: String,

    /// Month watermark (`YYYY-MM`) the monthly counter belongs to
    pub last_reset_monthly: String,

    /// Unix timestamp of the last write
    pub updated_at: i64,
}

/// Result of a usage-limit inspection
#[derive(Debug, Clone, Serialize)]
pub struct UsageCheck {
    /// Whether another request would currently be admitted
    pub allowed: bool,

    /// Requests available before the tighter of the two windows closes
    pub remaining: u32,

    /// Requests available in the current calendar day
    pub daily_remaining: u32,

    /// Requests available in the current calendar month
    pub monthly_remaining: u32,

    /// When the daily window rolls over (RFC 3339, next UTC midnight)
    pub resets_daily: String,

    /// When the monthly window rolls over (RFC 3339, first of next month)
    pub resets_monthly: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_scope_display() {
        assert_eq!(QuotaScope::Daily.to_string(), "daily");
        assert_eq!(QuotaScope::Monthly.to_string(), "monthly");
    }

    #[test]
    fn test_quota_scope_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&QuotaScope::Monthly).unwrap(),
            "\"monthly\""
        );
    }
}
