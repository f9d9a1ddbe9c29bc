//! Schema for the usage store
//!
//! One row per user in `ai_usage`, holding the current daily and monthly
//! counters together with the calendar watermarks that drive rollover.
//! Counter mutation happens through in-place SQL arithmetic so concurrent
//! increments are never lost; see the tracker for the check/increment
//! semantics built on top.

use crate::usage::error::DbError;
use libsql::{Connection, params};

/// Initialize the usage-store schema
pub async fn initialize_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ai_usage (
            user_id TEXT PRIMARY KEY,
            tier TEXT NOT NULL,
            daily_used INTEGER NOT NULL DEFAULT 0,
            monthly_used INTEGER NOT NULL DEFAULT 0,
            last_reset_daily TEXT NOT NULL,
            last_reset_monthly TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        params![],
    )
    .await
    .map_err(|e| DbError::Schema(format!("Failed to create ai_usage table: {}", e)))?;

    // Tier index keeps the per-tier stats query cheap.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ai_usage_tier ON ai_usage(tier)",
        params![],
    )
    .await
    .map_err(|e| DbError::Schema(format!("Failed to create index on ai_usage: {}", e)))?;

    Ok(())
}
