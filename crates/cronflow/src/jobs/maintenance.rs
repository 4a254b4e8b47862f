use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::jobs::error::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Terminal runs finished longer ago than this are deleted.
    pub run_days: i64,
    /// Newest terminal runs kept per job; older ones are deleted.
    pub max_runs_per_job: i64,
    /// Events older than this are deleted regardless of run state.
    pub event_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            run_days: 30,
            max_runs_per_job: 1000,
            event_days: 30,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub runs_expired: u64,
    pub runs_over_cap: u64,
    pub events_expired: u64,
}

impl PruneReport {
    pub fn total(&self) -> u64 {
        self.runs_expired + self.runs_over_cap + self.events_expired
    }
}

#[derive(Clone)]
pub struct MaintenanceRepo {
    pool: SqlitePool,
}

impl MaintenanceRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// One retention sweep. Runs that are not terminal are never touched.
    pub async fn prune(&self, cfg: &RetentionConfig, now: DateTime<Utc>) -> Result<PruneReport> {
        let mut tx = self.pool.begin().await?;

        // 1) age out finished runs (events go with them)
        let runs_expired = sqlx::query(
            r#"
            DELETE FROM job_runs
            WHERE status IN ('succeeded', 'failed', 'cancelled', 'timed_out', 'skipped')
              AND COALESCE(finished_at, created_at) < ?
            "#,
        )
        .bind(cutoff_days(now, cfg.run_days))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // 2) cap history per job, newest kept
        let runs_over_cap = sqlx::query(
            r#"
            DELETE FROM job_runs
            WHERE id IN (
              SELECT id
              FROM (
                SELECT
                  id,
                  ROW_NUMBER() OVER (
                    PARTITION BY job_id
                    ORDER BY COALESCE(finished_at, created_at) DESC, id DESC
                  ) AS rn
                FROM job_runs
                WHERE status IN ('succeeded', 'failed', 'cancelled', 'timed_out', 'skipped')
              )
              WHERE rn > ?
            )
            "#,
        )
        .bind(cfg.max_runs_per_job.max(0))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // 3) age out events of runs that are still around
        let events_expired = sqlx::query("DELETE FROM job_run_events WHERE created_at < ?")
            .bind(cutoff_days(now, cfg.event_days))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(PruneReport {
            runs_expired,
            runs_over_cap,
            events_expired,
        })
    }
}

/// `now - days`, saturating at the earliest representable instant.
pub fn cutoff_days(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    Duration::try_days(days.max(0))
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cutoff_subtracts_days() {
        let now = Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();
        assert_eq!(
            cutoff_days(now, 30),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(cutoff_days(now, -5), now);
    }

    #[test]
    fn huge_windows_saturate() {
        let now = Utc::now();
        assert_eq!(cutoff_days(now, i64::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
