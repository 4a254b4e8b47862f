use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::jobs::error::Result;
use crate::jobs::model::{Page, Paged, RunEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Queued,
    Claimed,
    Started,
    Succeeded,
    Failed,
    TimedOut,
    CancelRequested,
    Cancelled,
    RetryScheduled,
    Recovered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Queued => "queued",
            EventType::Claimed => "claimed",
            EventType::Started => "started",
            EventType::Succeeded => "succeeded",
            EventType::Failed => "failed",
            EventType::TimedOut => "timed_out",
            EventType::CancelRequested => "cancel_requested",
            EventType::Cancelled => "cancelled",
            EventType::RetryScheduled => "retry_scheduled",
            EventType::Recovered => "recovered",
        }
    }
}

/// Append one event through any executor (pool, connection or open transaction).
pub(crate) async fn append_event<'e, E>(
    executor: E,
    run_id: Uuid,
    event_type: EventType,
    message: &str,
    data: &Value,
    now: DateTime<Utc>,
) -> Result<Uuid>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id = Uuid::now_v7();
    sqlx::query(
        r#"
        INSERT INTO job_run_events (id, run_id, event_type, message, data, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(run_id)
    .bind(event_type.as_str())
    .bind(message)
    .bind(data.to_string())
    .bind(now)
    .execute(executor)
    .await?;
    Ok(id)
}

#[derive(Clone)]
pub struct RunEventsRepo {
    pool: SqlitePool,
}

impl RunEventsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        run_id: Uuid,
        event_type: EventType,
        message: &str,
        data: Value,
    ) -> Result<Uuid> {
        append_event(&self.pool, run_id, event_type, message, &data, Utc::now()).await
    }

    /// Events of one run in the order they happened.
    pub async fn list_for_run(&self, run_id: Uuid, page: Page) -> Result<Paged<RunEvent>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_run_events WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;

        let items = sqlx::query_as::<_, RunEvent>(
            r#"
            SELECT *
            FROM job_run_events
            WHERE run_id = ?
            ORDER BY created_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(run_id)
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

    /// Event types of one run, oldest first. Handy for assertions and the CLI.
    pub async fn types_for_run(&self, run_id: Uuid) -> Result<Vec<String>> {
        let types = sqlx::query_scalar::<_, String>(
            r#"
            SELECT event_type
            FROM job_run_events
            WHERE run_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(types)
    }
}
