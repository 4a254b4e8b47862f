use thiserror::Error;
use uuid::Uuid;

use crate::jobs::cron::CronError;

#[derive(Debug, Error)]
pub enum JobsError {
    /// Rejected input; nothing was persisted.
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("scheduler is closed")]
    Closed,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl JobsError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn job_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "job", id }
    }

    pub fn run_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "run", id }
    }

    /// Map a unique-constraint violation to `Conflict`, pass everything else through.
    pub(crate) fn from_write(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Self::Conflict(format!("{what} already exists"));
            }
        }
        Self::Database(err)
    }
}

impl From<CronError> for JobsError {
    fn from(e: CronError) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JobsError>;
