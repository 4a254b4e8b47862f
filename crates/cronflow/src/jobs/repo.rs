use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::jobs::error::{JobsError, Result};
use crate::jobs::model::{Job, NewJob, Page, Paged};

#[derive(Clone)]
pub struct JobsRepo {
    pool: SqlitePool,
}

impl JobsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Writes
    // ----------------------------

    /// Insert a validated job. `next_run_at` is computed by the caller.
    pub async fn insert(
        &self,
        job: &NewJob,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let retry_policy = job
            .retry_policy
            .as_ref()
            .filter(|v| !v.is_null())
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
              id, name, enabled,
              runner_type, runner_config,
              trigger_type, trigger_config,
              concurrency_policy, max_concurrent_runs,
              retry_policy, timeout_seconds, misfire_policy, labels,
              next_run_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job.name.trim())
        .bind(job.enabled)
        .bind(job.runner.runner_type().as_str())
        .bind(job.runner.to_value().to_string())
        .bind(job.trigger.trigger_type().as_str())
        .bind(job.trigger.to_value().to_string())
        .bind(job.concurrency_policy.as_str())
        .bind(job.max_concurrent_runs)
        .bind(retry_policy)
        .bind(job.timeout_seconds)
        .bind(&job.misfire_policy)
        .bind(job.labels.to_string())
        .bind(next_run_at)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| JobsError::from_write(e, &format!("job named {:?}", job.name.trim())))
    }

    /// Persist every mutable column of `job`, provided the row still carries
    /// `read_at` as its `updated_at`. `None` if the job is gone or changed.
    pub async fn update(
        &self,
        job: &Job,
        read_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let retry_policy = job
            .retry_policy
            .as_ref()
            .filter(|v| !v.is_null())
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET name = ?,
                enabled = ?,
                runner_type = ?,
                runner_config = ?,
                trigger_type = ?,
                trigger_config = ?,
                concurrency_policy = ?,
                max_concurrent_runs = ?,
                retry_policy = ?,
                timeout_seconds = ?,
                misfire_policy = ?,
                labels = ?,
                next_run_at = ?,
                updated_at = ?
            WHERE id = ?
              AND updated_at = ?
            RETURNING *
            "#,
        )
        .bind(job.name.trim())
        .bind(job.enabled)
        .bind(job.runner_type().as_str())
        .bind(job.runner.to_value().to_string())
        .bind(job.trigger_type().as_str())
        .bind(job.trigger.to_value().to_string())
        .bind(job.concurrency_policy.as_str())
        .bind(job.max_concurrent_runs)
        .bind(retry_policy)
        .bind(job.timeout_seconds)
        .bind(&job.misfire_policy)
        .bind(job.labels.to_string())
        .bind(job.next_run_at)
        .bind(now)
        .bind(job.id)
        .bind(read_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| JobsError::from_write(e, &format!("job named {:?}", job.name.trim())))
    }

    /// Leaves `next_run_at` alone so a firing that lands meanwhile is not undone.
    pub async fn disable(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET enabled = 0, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn enable(
        &self,
        job_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET enabled = 1, next_run_at = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(next_run_at)
        .bind(now)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Move the schedule forward after a firing (or a skipped firing).
    pub async fn advance(
        &self,
        job_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        disable: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET next_run_at = ?,
                enabled = CASE WHEN ? THEN 0 ELSE enabled END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(next_run_at)
        .bind(disable)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns false if the job did not exist. Runs and events cascade.
    pub async fn delete(&self, job_id: Uuid) -> Result<bool> {
        let res = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE name = ?")
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Newest first.
    pub async fn list(&self, page: Page) -> Result<Paged<Job>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;

        let items = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(Paged {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    /// Enabled jobs whose `next_run_at` has passed, oldest first.
    pub async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE enabled = 1
              AND next_run_at IS NOT NULL
              AND next_run_at <= ?
            ORDER BY next_run_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}
