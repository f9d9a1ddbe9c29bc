//! Subscription tiers and the static quota table
//!
//! Every limit enforced by this crate is keyed off the caller's [`Tier`].
//! The table is compiled in; there is no runtime configuration source.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Subscription level of a user, from least to most generous quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Free tier
    Free,
    /// Basic paid tier
    Basic,
    /// Professional tier
    Pro,
    /// Enterprise tier
    Enterprise,
}

/// All tiers, in ascending order
pub const ALL_TIERS: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Pro, Tier::Enterprise];

impl Tier {
    /// Maximum generation requests per calendar day
    pub fn daily_queries(&self) -> u32 {
        match self {
            Tier::Free => 10,
            Tier::Basic => 50,
            Tier::Pro => 200,
            Tier::Enterprise => 1_000,
        }
    }

    /// Maximum generation requests per calendar month
    pub fn monthly_queries(&self) -> u32 {
        match self {
            Tier::Free => 100,
            Tier::Basic => 1_000,
            Tier::Pro => 5_000,
            Tier::Enterprise => 30_000,
        }
    }

    /// Maximum requests within any trailing one-hour window
    pub fn queries_per_hour(&self) -> u32 {
        match self {
            Tier::Free => 5,
            Tier::Basic => 20,
            Tier::Pro => 60,
            Tier::Enterprise => 300,
        }
    }

    /// Maximum prompt length in characters
    pub fn max_prompt_length(&self) -> usize {
        match self {
            Tier::Free => 2_000,
            Tier::Basic => 4_000,
            Tier::Pro => 8_000,
            Tier::Enterprise => 16_000,
        }
    }

    /// Primary-provider model serving this tier
    pub fn model(&self) -> &'static str {
        match self {
            Tier::Free | Tier::Basic => "gemini-2.0-flash-lite",
            Tier::Pro | Tier::Enterprise => "gemini-2.0-flash",
        }
    }

    /// Canonical lowercase name, as stored in the usage table
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}
