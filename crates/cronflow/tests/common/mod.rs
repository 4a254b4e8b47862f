#![allow(dead_code)]

use async_trait::async_trait;
use cronflow::db::{self, PoolConfig};
use cronflow::jobs::{
    Job, Manager, ManagerConfig, NewJob, ProgramConfig, Run, RunContext, RunResult, RunStatus,
    RunEventsRepo, Runner, RunnerConfig, RunnerError, RunnerRegistry, RunnerType, TriggerConfig,
};
use cronflow::jobs::runners::ProgramRunner;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Fresh in-memory database with the schema applied.
pub async fn setup_db() -> SqlitePool {
    let pool = db::make_pool("sqlite::memory:", &PoolConfig::default())
        .await
        .expect("failed to open in-memory database");
    db::run_migrations(&pool).await.expect("migrations failed");
    pool
}

/// File-backed database with several connections, for tests that race.
pub async fn setup_file_db() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("cronflow.db").display());
    let pool = db::make_pool(
        &url,
        &PoolConfig {
            max_connections: 8,
            ..PoolConfig::default()
        },
    )
    .await
    .expect("failed to open file database");
    db::run_migrations(&pool).await.expect("migrations failed");
    (dir, pool)
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        worker_id: "test".into(),
        workers: 2,
        tick_interval: Duration::from_millis(20),
        idle_sleep: Duration::from_millis(10),
        cancel_grace: Duration::from_millis(300),
        ..ManagerConfig::default()
    }
}

pub fn program_registry() -> RunnerRegistry {
    let mut registry = RunnerRegistry::new();
    registry.register(RunnerType::Program, ProgramRunner::new());
    registry
}

pub async fn open_manager(pool: SqlitePool, registry: RunnerRegistry) -> Manager {
    Manager::open(pool, registry, test_config())
        .await
        .expect("failed to open manager")
}

pub fn program_job(name: &str, command: &str, args: &[&str], trigger: TriggerConfig) -> NewJob {
    NewJob::new(
        name,
        RunnerConfig::Program(ProgramConfig::new(command, args)),
        trigger,
    )
}

pub fn shell_job(name: &str, script: &str) -> NewJob {
    let mut cfg = ProgramConfig::new(script, &[]);
    cfg.shell = true;
    NewJob::new(name, RunnerConfig::Program(cfg), TriggerConfig::Manual)
}

pub fn manual_job(name: &str) -> NewJob {
    program_job(name, "true", &[], TriggerConfig::Manual)
}

/// Poll until the run satisfies `pred`, panicking after `timeout`.
pub async fn wait_for_run(
    manager: &Manager,
    run_id: Uuid,
    timeout: Duration,
    pred: impl Fn(&Run) -> bool,
) -> Run {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let run = manager.get_run(run_id).await.expect("get_run");
        if pred(&run) {
            return run;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("run {run_id} stuck in {:?}", run.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(
    manager: &Manager,
    run_id: Uuid,
    status: RunStatus,
    timeout: Duration,
) -> Run {
    wait_for_run(manager, run_id, timeout, |r| r.status == status).await
}

pub async fn event_types(pool: &SqlitePool, run_id: Uuid) -> Vec<String> {
    RunEventsRepo::new(pool.clone())
        .types_for_run(run_id)
        .await
        .expect("event types")
}

// ----------------------------
// Fake runners
// ----------------------------

/// Counts calls and returns a fixed result.
#[derive(Clone, Default)]
pub struct CountingRunner {
    pub calls: Arc<AtomicUsize>,
    pub fail_with: Option<String>,
}

impl CountingRunner {
    pub fn failing(message: &str) -> Self {
        Self {
            calls: Arc::default(),
            fail_with: Some(message.to_string()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for CountingRunner {
    async fn run(&self, _ctx: &RunContext, _job: &Job) -> Result<RunResult, RunnerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let out = RunResult {
            exit_code: Some(0),
            stdout: "ok\n".into(),
            ..RunResult::default()
        };
        match &self.fail_with {
            Some(msg) => Err(RunnerError::with_output(msg.clone(), out)),
            None => Ok(out),
        }
    }
}

/// Sleeps; optionally ignores cancellation entirely. `observed` is set once
/// the runner saw its cancel token fire.
#[derive(Clone)]
pub struct SleepyRunner {
    pub sleep: Duration,
    pub honour_cancel: bool,
    pub observed: Arc<AtomicBool>,
}

impl SleepyRunner {
    pub fn new(sleep: Duration, honour_cancel: bool) -> Self {
        Self {
            sleep,
            honour_cancel,
            observed: Arc::default(),
        }
    }

    pub fn saw_cancel(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for SleepyRunner {
    async fn run(&self, ctx: &RunContext, _job: &Job) -> Result<RunResult, RunnerError> {
        if self.honour_cancel {
            tokio::select! {
                _ = tokio::time::sleep(self.sleep) => Ok(RunResult::default()),
                _ = ctx.cancel.cancelled() => {
                    self.observed.store(true, Ordering::SeqCst);
                    Err(RunnerError::new("stopped"))
                }
            }
        } else {
            tokio::time::sleep(self.sleep).await;
            Ok(RunResult::default())
        }
    }
}

pub fn registry_with(runner: impl Runner + 'static) -> RunnerRegistry {
    let mut registry = RunnerRegistry::new();
    registry.register(RunnerType::Program, runner);
    registry
}
