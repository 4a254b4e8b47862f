use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jobs::model::{Job, RunnerType};

/// Output captured from one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub thinking: String,
    pub response: String,
}

/// A failed execution. `output` holds whatever was captured before the failure.
#[derive(Debug, Clone, Default)]
pub struct RunnerError {
    pub message: String,
    pub output: RunResult,
}

impl RunnerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: RunResult::default(),
        }
    }

    pub fn with_output(message: impl Into<String>, output: RunResult) -> Self {
        Self {
            message: message.into(),
            output,
        }
    }
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RunnerError {}

#[derive(Clone, Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub attempt: i32,
    /// Fires when the run is cancelled or the manager shuts down.
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, ctx: &RunContext, job: &Job) -> Result<RunResult, RunnerError>;
}

#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<RunnerType, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner_type: RunnerType, runner: impl Runner + 'static) {
        self.runners.insert(runner_type, Arc::new(runner));
    }

    pub fn runner_for(&self, runner_type: RunnerType) -> Option<Arc<dyn Runner>> {
        self.runners.get(&runner_type).cloned()
    }
}
