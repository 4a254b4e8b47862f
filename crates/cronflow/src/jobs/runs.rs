use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::jobs::error::Result;
use crate::jobs::events::{append_event, EventType};
use crate::jobs::model::{Page, Paged, Run, RunStatus, RunTrigger};

/// How many queued candidates one claim attempt walks before giving up.
const CLAIM_CANDIDATES: i64 = 8;

/// Final state written by a worker.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub thinking: String,
    pub response: String,
}

impl RunOutcome {
    pub fn bare(status: RunStatus, error: Option<String>) -> Self {
        Self {
            status,
            exit_code: None,
            error,
            stdout: String::new(),
            stderr: String::new(),
            thinking: String::new(),
            response: String::new(),
        }
    }
}

fn event_for(status: RunStatus) -> EventType {
    match status {
        RunStatus::Succeeded => EventType::Succeeded,
        RunStatus::TimedOut => EventType::TimedOut,
        RunStatus::Cancelled => EventType::Cancelled,
        _ => EventType::Failed,
    }
}

#[derive(Clone)]
pub struct RunsRepo {
    pool: SqlitePool,
}

impl RunsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    /// Insert a queued run and its `queued` event.
    pub async fn enqueue(
        &self,
        job_id: Uuid,
        attempt: i32,
        trigger: RunTrigger,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Run> {
        let mut tx = self.pool.begin().await?;

        let run = sqlx::query_as::<_, Run>(
            r#"
            INSERT INTO job_runs (id, job_id, attempt, run_trigger, scheduled_for, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'queued', ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(attempt)
        .bind(trigger.as_str())
        .bind(scheduled_for)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        append_event(
            &mut *tx,
            run.id,
            EventType::Queued,
            "run queued",
            &json!({ "trigger": trigger.as_str(), "attempt": attempt }),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(run)
    }

    /// Like [`enqueue`](Self::enqueue) but only if the job has no run in
    /// flight. The check and the insert are one statement, so two callers
    /// racing on the same job cannot both succeed.
    pub async fn enqueue_if_idle(
        &self,
        job_id: Uuid,
        attempt: i32,
        trigger: RunTrigger,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        let mut tx = self.pool.begin().await?;

        let run = sqlx::query_as::<_, Run>(
            r#"
            INSERT INTO job_runs (id, job_id, attempt, run_trigger, scheduled_for, status, created_at, updated_at)
            SELECT ?, ?, ?, ?, ?, 'queued', ?, ?
            WHERE NOT EXISTS (
              SELECT 1
              FROM job_runs
              WHERE job_id = ?
                AND status IN ('queued', 'claimed', 'running', 'cancel_requested')
            )
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(attempt)
        .bind(trigger.as_str())
        .bind(scheduled_for)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run) = run else {
            tx.rollback().await?;
            return Ok(None);
        };

        append_event(
            &mut *tx,
            run.id,
            EventType::Queued,
            "run queued",
            &json!({ "trigger": trigger.as_str(), "attempt": attempt }),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(Some(run))
    }

    // ----------------------------
    // Worker transitions
    // ----------------------------

    /// Claim the oldest due queued run for `worker_id`.
    ///
    /// Each candidate is taken with a conditional update on `status =
    /// 'queued'`; losing a race moves on to the next candidate.
    pub async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Run>> {
        let candidates = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM job_runs
            WHERE status = 'queued'
              AND scheduled_for <= ?
            ORDER BY scheduled_for ASC, created_at ASC, rowid ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(CLAIM_CANDIDATES)
        .fetch_all(&self.pool)
        .await?;

        for run_id in candidates {
            let mut tx = self.pool.begin().await?;

            let claimed = sqlx::query_as::<_, Run>(
                r#"
                UPDATE job_runs
                SET status = 'claimed',
                    worker_id = ?,
                    updated_at = ?
                WHERE id = ?
                  AND status = 'queued'
                RETURNING *
                "#,
            )
            .bind(worker_id)
            .bind(now)
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(run) = claimed else {
                tx.rollback().await?;
                continue;
            };

            append_event(
                &mut *tx,
                run.id,
                EventType::Claimed,
                "run claimed",
                &json!({ "worker_id": worker_id }),
                now,
            )
            .await?;

            tx.commit().await?;
            return Ok(Some(run));
        }

        Ok(None)
    }

    /// `claimed -> running`. `None` means the run left `claimed` (cancelled or deleted).
    pub async fn mark_running(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<Option<Run>> {
        let mut tx = self.pool.begin().await?;

        let run = sqlx::query_as::<_, Run>(
            r#"
            UPDATE job_runs
            SET status = 'running',
                started_at = ?,
                updated_at = ?
            WHERE id = ?
              AND status = 'claimed'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run) = run else {
            tx.rollback().await?;
            return Ok(None);
        };

        append_event(&mut *tx, run.id, EventType::Started, "run started", &json!({}), now).await?;

        tx.commit().await?;
        Ok(Some(run))
    }

    /// Write the final state of an executing run.
    ///
    /// A pending cancel request always wins: such a run ends `cancelled`
    /// whatever the runner returned. Returns the stored status, or `None` if
    /// the run was no longer executing.
    pub async fn finish(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<RunStatus>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, Run>(
            r#"
            UPDATE job_runs
            SET status = CASE WHEN status = 'cancel_requested' THEN 'cancelled' ELSE ? END,
                finished_at = ?,
                exit_code = ?,
                error = ?,
                stdout = ?,
                stderr = ?,
                thinking = ?,
                response = ?,
                updated_at = ?
            WHERE id = ?
              AND status IN ('claimed', 'running', 'cancel_requested')
            RETURNING *
            "#,
        )
        .bind(outcome.status.as_str())
        .bind(now)
        .bind(outcome.exit_code)
        .bind(outcome.error.as_deref())
        .bind(&outcome.stdout)
        .bind(&outcome.stderr)
        .bind(&outcome.thinking)
        .bind(&outcome.response)
        .bind(now)
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let message = match run.status {
            RunStatus::Succeeded => "run succeeded".to_string(),
            RunStatus::Cancelled => "run cancelled".to_string(),
            RunStatus::TimedOut => "run timed out".to_string(),
            _ => format!("run failed: {}", outcome.error.as_deref().unwrap_or("unknown error")),
        };

        append_event(
            &mut *tx,
            run.id,
            event_for(run.status),
            &message,
            &json!({ "exit_code": outcome.exit_code }),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(Some(run.status))
    }

    /// Record that a retry run was queued for `run_id`.
    pub async fn note_retry(
        &self,
        run_id: Uuid,
        retry_run_id: Uuid,
        next_attempt: i32,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        append_event(
            &self.pool,
            run_id,
            EventType::RetryScheduled,
            &format!("retry scheduled as attempt {next_attempt}"),
            &json!({
                "retry_run_id": retry_run_id,
                "attempt": next_attempt,
                "scheduled_for": scheduled_for,
            }),
            now,
        )
        .await?;
        Ok(())
    }

    // ----------------------------
    // Cancellation
    // ----------------------------

    /// `queued | claimed -> cancelled`. `None` if the run had already started
    /// or finished. A worker holding the claim sees `mark_running` miss.
    pub async fn cancel_before_start(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        let mut tx = self.pool.begin().await?;

        let run = sqlx::query_as::<_, Run>(
            r#"
            UPDATE job_runs
            SET status = 'cancelled',
                finished_at = ?,
                updated_at = ?
            WHERE id = ?
              AND status IN ('queued', 'claimed')
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run) = run else {
            tx.rollback().await?;
            return Ok(None);
        };

        append_event(&mut *tx, run.id, EventType::Cancelled, "cancelled before start", &json!({}), now)
            .await?;

        tx.commit().await?;
        Ok(Some(run))
    }

    /// `running -> cancel_requested`. The worker finishes the transition.
    pub async fn request_cancel(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<Option<Run>> {
        let mut tx = self.pool.begin().await?;

        let run = sqlx::query_as::<_, Run>(
            r#"
            UPDATE job_runs
            SET status = 'cancel_requested',
                updated_at = ?
            WHERE id = ?
              AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run) = run else {
            tx.rollback().await?;
            return Ok(None);
        };

        append_event(
            &mut *tx,
            run.id,
            EventType::CancelRequested,
            "cancel requested",
            &json!({}),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(Some(run))
    }

    // ----------------------------
    // Recovery
    // ----------------------------

    /// Put runs left in flight by a previous process back in the queue.
    /// Already queued runs are untouched, so calling this twice is a no-op.
    pub async fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let stale = sqlx::query_as::<_, (Uuid, String, Option<String>)>(
            r#"
            SELECT id, status, worker_id
            FROM job_runs
            WHERE status IN ('claimed', 'running', 'cancel_requested')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut ids = Vec::with_capacity(stale.len());
        for (run_id, status, worker_id) in stale {
            let mut tx = self.pool.begin().await?;

            let res = sqlx::query(
                r#"
                UPDATE job_runs
                SET status = 'queued',
                    worker_id = NULL,
                    started_at = NULL,
                    updated_at = ?
                WHERE id = ?
                  AND status = ?
                "#,
            )
            .bind(now)
            .bind(run_id)
            .bind(&status)
            .execute(&mut *tx)
            .await?;

            if res.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }

            append_event(
                &mut *tx,
                run_id,
                EventType::Recovered,
                "requeued after restart",
                &json!({ "previous_status": status, "worker_id": worker_id }),
                now,
            )
            .await?;

            tx.commit().await?;
            ids.push(run_id);
        }

        Ok(ids)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get(&self, run_id: Uuid) -> Result<Option<Run>> {
        let run = sqlx::query_as::<_, Run>("SELECT * FROM job_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(run)
    }

    /// Newest first, optionally for one job.
    pub async fn list(&self, job_id: Option<Uuid>, page: Page) -> Result<Paged<Run>> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_runs WHERE (? IS NULL OR job_id = ?)",
        )
        .bind(job_id)
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        let items = sqlx::query_as::<_, Run>(
            r#"
            SELECT *
            FROM job_runs
            WHERE (? IS NULL OR job_id = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(job_id)
        .bind(job_id)
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

    /// Runs of `job_id` that are queued, claimed or running.
    pub async fn active_for_job(&self, job_id: Uuid) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            r#"
            SELECT *
            FROM job_runs
            WHERE job_id = ?
              AND status IN ('queued', 'claimed', 'running')
            ORDER BY created_at ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    pub async fn count_for_job(&self, job_id: Uuid) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM job_runs WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
