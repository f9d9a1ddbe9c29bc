//! Quota enforcement over the usage store
//!
//! The tracker owns the check/increment call path: lazy row creation,
//! calendar rollover on day and month watermarks, and limit evaluation with
//! daily checked before monthly. Counter increments go through the store's
//! in-place arithmetic so concurrent requests never lose an update; the
//! limit check itself is a plain read and is deliberately not atomic with
//! the increment, which bounds overshoot to the number of requests a single
//! user can have in flight at once.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::tiers::Tier;
use crate::usage::{Database, QuotaScope, UsageCheck, UsageRecord};

/// Aggregate reporting view over the usage store
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    /// Users with a usage row
    pub users: u64,

    /// Sum of all users' daily counters
    pub daily_total: u64,

    /// Sum of all users' monthly counters
    pub monthly_total: u64,

    /// User count per tier
    pub users_by_tier: HashMap<Tier, u64>,
}

/// Enforces daily and monthly quotas against the usage store
#[derive(Clone)]
pub struct UsageTracker {
    db: Database,
}

impl UsageTracker {
    /// Create a tracker over an initialized usage database
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Check the user's quotas, rolling counters over at calendar boundaries.
    ///
    /// Fails with [`Error::UsageLimit`] when a window is exhausted, daily
    /// before monthly. Does not consume quota.
    #[instrument(skip(self), level = "debug")]
    pub async fn check(&self, user_id: &str, tier: Tier) -> Result<UsageCheck> {
        let record = self.load_current(user_id, tier).await?;
        let check = build_check(&record, tier, Utc::now());

        if check.daily_remaining == 0 {
            return Err(Error::UsageLimit {
                scope: QuotaScope::Daily,
                resets_at: check.resets_daily,
            });
        }
        if check.monthly_remaining == 0 {
            return Err(Error::UsageLimit {
                scope: QuotaScope::Monthly,
                resets_at: check.resets_monthly,
            });
        }

        Ok(check)
    }

    /// Consume one request: re-check, then increment both counters.
    ///
    /// The returned check reflects the counters after the increment. The
    /// check and the increment are two store operations, not one
    /// transaction; see the module docs for the overshoot this admits.
    #[instrument(skip(self), level = "debug")]
    pub async fn increment(&self, user_id: &str, tier: Tier) -> Result<UsageCheck> {
        self.check(user_id, tier).await?;
        self.db.increment(user_id, Utc::now().timestamp()).await?;
        debug!(user_id, %tier, "usage incremented");
        self.status(user_id, tier).await
    }

    /// Non-failing variant of [`UsageTracker::check`] for reporting:
    /// exhaustion shows up as `allowed == false` instead of an error.
    pub async fn status(&self, user_id: &str, tier: Tier) -> Result<UsageCheck> {
        let record = self.load_current(user_id, tier).await?;
        Ok(build_check(&record, tier, Utc::now()))
    }

    /// Load the user's current usage row
    pub async fn record(&self, user_id: &str, tier: Tier) -> Result<UsageRecord> {
        self.load_current(user_id, tier).await
    }

    /// Zero one window's counter, or both when no scope is given
    pub async fn reset(&self, user_id: &str, scope: Option<QuotaScope>) -> Result<()> {
        let now = Utc::now();
        let now_unix = now.timestamp();

        let scopes: &[QuotaScope] = match scope {
            Some(QuotaScope::Daily) => &[QuotaScope::Daily],
            Some(QuotaScope::Monthly) => &[QuotaScope::Monthly],
            None => &[QuotaScope::Daily, QuotaScope::Monthly],
        };

        for scope in scopes {
            let period = match scope {
                QuotaScope::Daily => day_period(now),
                QuotaScope::Monthly => month_period(now),
            };
            self.db
                .reset_counter(user_id, *scope, &period, now_unix)
                .await?;
        }

        Ok(())
    }

    /// Change the tier stored on the user's row
    pub async fn update_tier(&self, user_id: &str, tier: Tier) -> Result<()> {
        // Make sure the row exists so a tier change before first use sticks.
        self.load_current(user_id, tier).await?;
        self.db.set_tier(user_id, tier, Utc::now().timestamp()).await?;
        Ok(())
    }

    /// Aggregate usage across all users
    pub async fn stats(&self) -> Result<UsageStats> {
        let totals = self.db.totals().await?;
        Ok(UsageStats {
            users: totals.users,
            daily_total: totals.daily_total,
            monthly_total: totals.monthly_total,
            users_by_tier: totals.users_by_tier,
        })
    }

    /// Load the row, creating it lazily and applying calendar rollover.
    async fn load_current(&self, user_id: &str, tier: Tier) -> Result<UsageRecord> {
        let now = Utc::now();

        let mut record = match self.db.get(user_id).await? {
            Some(record) => record,
            None => {
                let fresh = fresh_record(user_id, tier, now);
                self.db.insert_if_absent(&fresh).await?;
                // Re-read instead of returning the local copy: a concurrent
                // initializer may have won the insert.
                self.db.get(user_id).await?.ok_or_else(|| {
                    Error::Database(format!("usage record missing after insert: {}", user_id))
                })?
            }
        };

        let (daily_rolled, monthly_rolled) = rollover(&mut record, now);
        if daily_rolled {
            self.db
                .reset_counter(user_id, QuotaScope::Daily, &record.last_reset_daily, now.timestamp())
                .await?;
        }
        if monthly_rolled {
            self.db
                .reset_counter(
                    user_id,
                    QuotaScope::Monthly,
                    &record.last_reset_monthly,
                    now.timestamp(),
                )
                .await?;
        }

        Ok(record)
    }
}

/// Fresh row for a user seen for the first time
fn fresh_record(user_id: &str, tier: Tier, now: DateTime<Utc>) -> UsageRecord {
    UsageRecord {
        user_id: user_id.to_string(),
        tier,
        daily_used: 0,
        monthly_used: 0,
        last_reset_daily: day_period(now),
        last_reset_monthly: month_period(now),
        updated_at: now.timestamp(),
    }
}

/// Reset counters whose watermark no longer matches the current period.
///
/// Mutates the record in place and reports which windows rolled; the caller
/// persists the matching resets. Comparison is exact string equality on the
/// canonical period representation, using the process clock as-is.
fn rollover(record: &mut UsageRecord, now: DateTime<Utc>) -> (bool, bool) {
    let today = day_period(now);
    let month = month_period(now);

    let daily_rolled = record.last_reset_daily != today;
    if daily_rolled {
        record.daily_used = 0;
        record.last_reset_daily = today;
    }

    let monthly_rolled = record.last_reset_monthly != month;
    if monthly_rolled {
        record.monthly_used = 0;
        record.last_reset_monthly = month;
    }

    (daily_rolled, monthly_rolled)
}

/// Evaluate remaining quota for a record, clamping at zero
fn build_check(record: &UsageRecord, tier: Tier, now: DateTime<Utc>) -> UsageCheck {
    let daily_remaining = tier.daily_queries().saturating_sub(record.daily_used);
    let monthly_remaining = tier.monthly_queries().saturating_sub(record.monthly_used);

    UsageCheck {
        allowed: daily_remaining > 0 && monthly_remaining > 0,
        remaining: daily_remaining.min(monthly_remaining),
        daily_remaining,
        monthly_remaining,
        resets_daily: next_utc_midnight(now).to_rfc3339(),
        resets_monthly: first_of_next_month(now).to_rfc3339(),
    }
}

/// Canonical `YYYY-MM-DD` representation of the current day
fn day_period(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Canonical `YYYY-MM` representation of the current month
fn month_period(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Midnight UTC of the following day
fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let next_day = now.date_naive() + Days::new(1);
    Utc.from_utc_datetime(&next_day.and_time(NaiveTime::MIN))
}

/// Midnight UTC on the first day of the following month
fn first_of_next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .expect("first day of a month is always a valid date");
    Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    async fn setup_tracker() -> (UsageTracker, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("usage.db").to_string_lossy().to_string();
        let db = Database::new_from_path(&db_path).await.unwrap();
        (UsageTracker::new(db), temp_dir)
    }

    #[test]
    fn test_period_formatting() {
        let now = utc("2026-08-07T15:04:05Z");
        assert_eq!(day_period(now), "2026-08-07");
        assert_eq!(month_period(now), "2026-08");
    }

    #[test]
    fn test_next_utc_midnight_crosses_month_and_year() {
        assert_eq!(
            next_utc_midnight(utc("2026-08-31T23:59:59Z")),
            utc("2026-09-01T00:00:00Z")
        );
        assert_eq!(
            next_utc_midnight(utc("2026-12-31T12:00:00Z")),
            utc("2027-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_first_of_next_month_wraps_december() {
        assert_eq!(
            first_of_next_month(utc("2026-12-07T00:00:00Z")),
            utc("2027-01-01T00:00:00Z")
        );
        assert_eq!(
            first_of_next_month(utc("2026-08-07T00:00:00Z")),
            utc("2026-09-01T00:00:00Z")
        );
    }

    #[test]
    fn test_rollover_same_day_is_idempotent() {
        let now = utc("2026-08-07T10:00:00Z");
        let mut record = fresh_record("alice", Tier::Free, now);
        record.daily_used = 4;
        record.monthly_used = 9;

        let (daily, monthly) = rollover(&mut record, utc("2026-08-07T23:00:00Z"));
        assert!(!daily);
        assert!(!monthly);
        assert_eq!(record.daily_used, 4);
        assert_eq!(record.monthly_used, 9);
    }

    #[test]
    fn test_rollover_day_boundary_resets_daily_only() {
        let mut record = fresh_record("alice", Tier::Free, utc("2026-08-07T10:00:00Z"));
        record.daily_used = 4;
        record.monthly_used = 9;

        let (daily, monthly) = rollover(&mut record, utc("2026-08-08T00:00:01Z"));
        assert!(daily);
        assert!(!monthly);
        assert_eq!(record.daily_used, 0);
        assert_eq!(record.monthly_used, 9);
        assert_eq!(record.last_reset_daily, "2026-08-08");
    }

    #[test]
    fn test_rollover_month_boundary_resets_both() {
        let mut record = fresh_record("alice", Tier::Free, utc("2026-08-31T10:00:00Z"));
        record.daily_used = 4;
        record.monthly_used = 9;

        let (daily, monthly) = rollover(&mut record, utc("2026-09-01T00:00:01Z"));
        assert!(daily);
        assert!(monthly);
        assert_eq!(record.daily_used, 0);
        assert_eq!(record.monthly_used, 0);
        assert_eq!(record.last_reset_monthly, "2026-09");
    }

    #[test]
    fn test_build_check_daily_exhausted() {
        let now = utc("2026-08-07T10:00:00Z");
        let mut record = fresh_record("alice", Tier::Free, now);
        record.daily_used = Tier::Free.daily_queries();

        let check = build_check(&record, Tier::Free, now);
        assert!(!check.allowed);
        assert_eq!(check.daily_remaining, 0);
        assert_eq!(check.remaining, 0);
        assert!(check.monthly_remaining > 0);
    }

    #[test]
    fn test_build_check_clamps_overshoot() {
        let now = utc("2026-08-07T10:00:00Z");
        let mut record = fresh_record("alice", Tier::Free, now);
        record.daily_used = Tier::Free.daily_queries() + 3;

        let check = build_check(&record, Tier::Free, now);
        assert_eq!(check.daily_remaining, 0);
    }

    #[tokio::test]
    async fn test_check_initializes_lazily() {
        let (tracker, _temp_dir) = setup_tracker().await;

        let check = tracker.check("alice", Tier::Free).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.daily_remaining, Tier::Free.daily_queries());
        assert_eq!(check.monthly_remaining, Tier::Free.monthly_queries());

        // The row now exists with zero counters.
        let record = tracker.record("alice", Tier::Free).await.unwrap();
        assert_eq!(record.daily_used, 0);
    }

    #[tokio::test]
    async fn test_check_without_increment_does_not_consume() {
        let (tracker, _temp_dir) = setup_tracker().await;

        tracker.check("alice", Tier::Free).await.unwrap();
        tracker.check("alice", Tier::Free).await.unwrap();

        let record = tracker.record("alice", Tier::Free).await.unwrap();
        assert_eq!(record.daily_used, 0);
        assert_eq!(record.monthly_used, 0);
    }

    #[tokio::test]
    async fn test_increment_consumes_and_reports_fresh_counts() {
        let (tracker, _temp_dir) = setup_tracker().await;

        let check = tracker.increment("alice", Tier::Free).await.unwrap();
        assert_eq!(check.daily_remaining, Tier::Free.daily_queries() - 1);
        assert_eq!(check.monthly_remaining, Tier::Free.monthly_queries() - 1);

        let record = tracker.record("alice", Tier::Free).await.unwrap();
        assert_eq!(record.daily_used, 1);
        assert_eq!(record.monthly_used, 1);
    }

    #[tokio::test]
    async fn test_daily_limit_throws_before_monthly() {
        let (tracker, _temp_dir) = setup_tracker().await;

        for _ in 0..Tier::Free.daily_queries() {
            tracker.increment("alice", Tier::Free).await.unwrap();
        }

        match tracker.check("alice", Tier::Free).await {
            Err(Error::UsageLimit { scope, resets_at }) => {
                assert_eq!(scope, QuotaScope::Daily);
                assert!(!resets_at.is_empty());
            }
            other => panic!("expected daily usage limit, got {:?}", other.err()),
        }

        // The final admitted increment consumed the last slot; one more
        // attempt must fail at the check stage without touching counters.
        assert!(tracker.increment("alice", Tier::Free).await.is_err());
        let record = tracker.record("alice", Tier::Free).await.unwrap();
        assert_eq!(record.daily_used, Tier::Free.daily_queries());
    }

    #[tokio::test]
    async fn test_status_reports_exhaustion_without_error() {
        let (tracker, _temp_dir) = setup_tracker().await;

        for _ in 0..Tier::Free.daily_queries() {
            tracker.increment("alice", Tier::Free).await.unwrap();
        }

        let status = tracker.status("alice", Tier::Free).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.daily_remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_daily_scope() {
        let (tracker, _temp_dir) = setup_tracker().await;
        tracker.increment("alice", Tier::Free).await.unwrap();

        tracker.reset("alice", Some(QuotaScope::Daily)).await.unwrap();

        let record = tracker.record("alice", Tier::Free).await.unwrap();
        assert_eq!(record.daily_used, 0);
        assert_eq!(record.monthly_used, 1);

        tracker.reset("alice", None).await.unwrap();
        let record = tracker.record("alice", Tier::Free).await.unwrap();
        assert_eq!(record.monthly_used, 0);
    }

    #[tokio::test]
    async fn test_update_tier_persists() {
        let (tracker, _temp_dir) = setup_tracker().await;

        tracker.update_tier("alice", Tier::Pro).await.unwrap();
        let record = tracker.record("alice", Tier::Pro).await.unwrap();
        assert_eq!(record.tier, Tier::Pro);
    }

    #[tokio::test]
    async fn test_stats_aggregates() {
        let (tracker, _temp_dir) = setup_tracker().await;
        tracker.increment("alice", Tier::Free).await.unwrap();
        tracker.increment("bob", Tier::Pro).await.unwrap();
        tracker.increment("bob", Tier::Pro).await.unwrap();

        let stats = tracker.stats().await.unwrap();
        assert_eq!(stats.users, 2);
        assert_eq!(stats.daily_total, 3);
        assert_eq!(stats.users_by_tier[&Tier::Free], 1);
        assert_eq!(stats.users_by_tier[&Tier::Pro], 1);
    }
}
