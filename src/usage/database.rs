//! Database operations for the usage store

use crate::usage::error::DbError;
use crate::usage::{QuotaScope, UsageRecord, schema};
use libsql::{Connection, Row, params};
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::tiers::{ALL_TIERS, Tier};

/// Aggregate totals over the usage table
#[derive(Debug, Clone, Default)]
pub(crate) struct UsageTotals {
    pub users: u64,
    pub daily_total: u64,
    pub monthly_total: u64,
    pub users_by_tier: HashMap<Tier, u64>,
}

/// Database manager for the usage store
#[derive(Clone)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Create a new database manager
    #[instrument(skip(conn))]
    pub async fn new(conn: Connection) -> Result<Self, DbError> {
        schema::initialize_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Create a new database manager from a path
    pub async fn new_from_path(path: &str) -> Result<Self, DbError> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DbError::Connection(format!("Failed to open database: {}", e)))?;

        let conn = db
            .connect()
            .map_err(|e| DbError::Connection(format!("Failed to connect to database: {}", e)))?;

        Self::new(conn).await
    }

    /// Load a user's usage row
    pub async fn get(&self, user_id: &str) -> Result<Option<UsageRecord>, DbError> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_id, tier, daily_used, monthly_used,
                        last_reset_daily, last_reset_monthly, updated_at
                 FROM ai_usage
                 WHERE user_id = ?",
                params![user_id],
            )
            .await
            .map_err(|e| DbError::Query(format!("Failed to get usage record: {}", e)))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DbError::Data(format!("Failed to get usage record: {}", e))),
        }
    }

    /// Insert a fresh usage row unless one already exists.
    ///
    /// Two callers racing to initialize the same user both succeed; the row
    /// written first wins and the loser's insert is a no-op.
    pub async fn insert_if_absent(&self, record: &UsageRecord) -> Result<(), DbError> {
        self.conn
            .execute(
                "INSERT INTO ai_usage (user_id, tier, daily_used, monthly_used,
                                       last_reset_daily, last_reset_monthly, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(user_id) DO NOTHING",
                params![
                    record.user_id.clone(),
                    record.tier.as_str(),
                    record.daily_used as i64,
                    record.monthly_used as i64,
                    record.last_reset_daily.clone(),
                    record.last_reset_monthly.clone(),
                    record.updated_at,
                ],
            )
            .await
            .map_err(|e| DbError::Query(format!("Failed to insert usage record: {}", e)))?;

        debug!(user_id = %record.user_id, tier = %record.tier, "initialized usage record");
        Ok(())
    }

    /// Consume one request from both windows via in-place arithmetic.
    ///
    /// The addition happens inside the store, so two concurrent increments
    /// both land; nothing here re-checks the limit (that is the tracker's
    /// job, and deliberately not atomic with this update).
    pub async fn increment(&self, user_id: &str, now_unix: i64) -> Result<(), DbError> {
        self.conn
            .execute(
                "UPDATE ai_usage
                 SET daily_used = daily_used + 1,
                     monthly_used = monthly_used + 1,
                     updated_at = ?
                 WHERE user_id = ?",
                params![now_unix, user_id],
            )
            .await
            .map_err(|e| DbError::Query(format!("Failed to increment usage: {}", e)))?;

        Ok(())
    }

    /// Zero one counter and stamp its watermark with the current period
    pub async fn reset_counter(
        &self,
        user_id: &str,
        scope: QuotaScope,
        period: &str,
        now_unix: i64,
    ) -> Result<(), DbError> {
        let sql = match scope {
            QuotaScope::Daily => {
                "UPDATE ai_usage
                 SET daily_used = 0, last_reset_daily = ?, updated_at = ?
                 WHERE user_id = ?"
            }
            QuotaScope::Monthly => {
                "UPDATE ai_usage
                 SET monthly_used = 0, last_reset_monthly = ?, updated_at = ?
                 WHERE user_id = ?"
            }
        };

        self.conn
            .execute(sql, params![period, now_unix, user_id])
            .await
            .map_err(|e| DbError::Query(format!("Failed to reset {} usage: {}", scope, e)))?;

        debug!(user_id, %scope, period, "reset usage counter");
        Ok(())
    }

    /// Change the stored tier for a user
    pub async fn set_tier(&self, user_id: &str, tier: Tier, now_unix: i64) -> Result<(), DbError> {
        self.conn
            .execute(
                "UPDATE ai_usage SET tier = ?, updated_at = ? WHERE user_id = ?",
                params![tier.as_str(), now_unix, user_id],
            )
            .await
            .map_err(|e| DbError::Query(format!("Failed to update tier: {}", e)))?;

        Ok(())
    }

    /// Aggregate totals across all usage rows
    pub(crate) async fn totals(&self) -> Result<UsageTotals, DbError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(daily_used), 0),
                        COALESCE(SUM(monthly_used), 0)
                 FROM ai_usage",
                params![],
            )
            .await
            .map_err(|e| DbError::Query(format!("Failed to aggregate usage: {}", e)))?;

        let mut totals = UsageTotals::default();
        if let Ok(Some(row)) = rows.next().await {
            totals.users = get_u64(&row, 0)?;
            totals.daily_total = get_u64(&row, 1)?;
            totals.monthly_total = get_u64(&row, 2)?;
        }

        let mut rows = self
            .conn
            .query(
                "SELECT tier, COUNT(*) FROM ai_usage GROUP BY tier",
                params![],
            )
            .await
            .map_err(|e| DbError::Query(format!("Failed to aggregate tiers: {}", e)))?;

        for tier in ALL_TIERS {
            totals.users_by_tier.insert(tier, 0);
        }
        while let Ok(Some(row)) = rows.next().await {
            let tier: String = row
                .get(0)
                .map_err(|e| DbError::Data(format!("Failed to get tier: {}", e)))?;
            let tier = tier
                .parse::<Tier>()
                .map_err(|e| DbError::Data(format!("Failed to parse tier: {}", e)))?;
            totals.users_by_tier.insert(tier, get_u64(&row, 1)?);
        }

        Ok(totals)
    }
}

fn get_u64(row: &Row, index: i32) -> Result<u64, DbError> {
    let value: i64 = row
        .get(index)
        .map_err(|e| DbError::Data(format!("Failed to get column {}: {}", index, e)))?;
    Ok(value.max(0) as u64)
}

/// Convert a database row to a UsageRecord
fn row_to_record(row: &Row) -> Result<UsageRecord, DbError> {
    let tier: String = row
        .get(1)
        .map_err(|e| DbError::Data(format!("Failed to get tier: {}", e)))?;
    let tier = tier
        .parse::<Tier>()
        .map_err(|e| DbError::Data(format!("Failed to parse tier: {}", e)))?;

    Ok(UsageRecord {
        user_id: row
            .get(0)
            .map_err(|e| DbError::Data(format!("Failed to get user_id: {}", e)))?,
        tier,
        daily_used: row
            .get::<i64>(2)
            .map_err(|e| DbError::Data(format!("Failed to get daily_used: {}", e)))?
            .max(0) as u32,
        monthly_used: row
            .get::<i64>(3)
            .map_err(|e| DbError::Data(format!("Failed to get monthly_used: {}", e)))?
            .max(0) as u32,
        last_reset_daily: row
            .get(4)
            .map_err(|e| DbError::Data(format!("Failed to get last_reset_daily: {}", e)))?,
        last_reset_monthly: row
            .get(5)
            .map_err(|e| DbError::Data(format!("Failed to get last_reset_monthly: {}", e)))?,
        updated_at: row
            .get(6)
            .map_err(|e| DbError::Data(format!("Failed to get updated_at: {}", e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    async fn setup_test_db() -> (Database, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db").to_string_lossy().to_string();
        let db = Database::new_from_path(&db_path).await.unwrap();
        (db, temp_dir)
    }

    fn sample_record(user_id: &str, tier: Tier) -> UsageRecord {
        UsageRecord {
            user_id: user_id.to_string(),
            tier,
            daily_used: 0,
            monthly_used: 0,
            last_reset_daily: "2026-08-07".to_string(),
            last_reset_monthly: "2026-08".to_string(),
            updated_at: 1_786_500_000,
        }
    }

    #[tokio::test]
    async fn test_database_initialization() {
        let (db, _temp_dir) = setup_test_db().await;

        let mut rows = db
            .conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='ai_usage'",
                params![],
            )
            .await
            .unwrap();

        assert!(rows.next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (db, _temp_dir) = setup_test_db().await;

        assert!(db.get("alice").await.unwrap().is_none());

        db.insert_if_absent(&sample_record("alice", Tier::Free))
            .await
            .unwrap();

        let record = db.get("alice").await.unwrap().unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.tier, Tier::Free);
        assert_eq!(record.daily_used, 0);
        assert_eq!(record.monthly_used, 0);
        assert_eq!(record.last_reset_daily, "2026-08-07");
        assert_eq!(record.last_reset_monthly, "2026-08");
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing_row() {
        let (db, _temp_dir) = setup_test_db().await;

        db.insert_if_absent(&sample_record("alice", Tier::Free))
            .await
            .unwrap();
        db.increment("alice", 1_786_500_100).await.unwrap();

        // A second initialization attempt must not clobber the counters.
        db.insert_if_absent(&sample_record("alice", Tier::Pro))
            .await
            .unwrap();

        let record = db.get("alice").await.unwrap().unwrap();
        assert_eq!(record.tier, Tier::Free);
        assert_eq!(record.daily_used, 1);
    }

    #[tokio::test]
    async fn test_increment_bumps_both_counters() {
        let (db, _temp_dir) = setup_test_db().await;
        db.insert_if_absent(&sample_record("alice", Tier::Free))
            .await
            .unwrap();

        db.increment("alice", 1_786_500_100).await.unwrap();
        db.increment("alice", 1_786_500_200).await.unwrap();

        let record = db.get("alice").await.unwrap().unwrap();
        assert_eq!(record.daily_used, 2);
        assert_eq!(record.monthly_used, 2);
        assert_eq!(record.updated_at, 1_786_500_200);
    }

    #[tokio::test]
    async fn test_reset_counter_scopes() {
        let (db, _temp_dir) = setup_test_db().await;
        db.insert_if_absent(&sample_record("alice", Tier::Free))
            .await
            .unwrap();
        db.increment("alice", 1_786_500_100).await.unwrap();

        db.reset_counter("alice", QuotaScope::Daily, "2026-08-08", 1_786_586_400)
            .await
            .unwrap();

        let record = db.get("alice").await.unwrap().unwrap();
        assert_eq!(record.daily_used, 0);
        assert_eq!(record.last_reset_daily, "2026-08-08");
        // Monthly counter untouched by a daily reset.
        assert_eq!(record.monthly_used, 1);
        assert_eq!(record.last_reset_monthly, "2026-08");
    }

    #[tokio::test]
    async fn test_set_tier() {
        let (db, _temp_dir) = setup_test_db().await;
        db.insert_if_absent(&sample_record("alice", Tier::Free))
            .await
            .unwrap();

        db.set_tier("alice", Tier::Enterprise, 1_786_500_300)
            .await
            .unwrap();

        let record = db.get("alice").await.unwrap().unwrap();
        assert_eq!(record.tier, Tier::Enterprise);
    }

    #[tokio::test]
    async fn test_totals() {
        let (db, _temp_dir) = setup_test_db().await;
        db.insert_if_absent(&sample_record("alice", Tier::Free))
            .await
            .unwrap();
        db.insert_if_absent(&sample_record("bob", Tier::Pro))
            .await
            .unwrap();
        db.increment("alice", 1_786_500_100).await.unwrap();
        db.increment("bob", 1_786_500_100).await.unwrap();
        db.increment("bob", 1_786_500_200).await.unwrap();

        let totals = db.totals().await.unwrap();
        assert_eq!(totals.users, 2);
        assert_eq!(totals.daily_total, 3);
        assert_eq!(totals.monthly_total, 3);
        assert_eq!(totals.users_by_tier[&Tier::Free], 1);
        assert_eq!(totals.users_by_tier[&Tier::Pro], 1);
        assert_eq!(totals.users_by_tier[&Tier::Basic], 0);
    }
}
