use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::db;
use crate::jobs::error::{JobsError, Result};
use crate::jobs::events::RunEventsRepo;
use crate::jobs::maintenance::{MaintenanceRepo, PruneReport, RetentionConfig};
use crate::jobs::model::{
    ConcurrencyPolicy, Job, JobPatch, NewJob, Page, Paged, Run, RunEvent, RunStatus, RunTrigger,
    TriggerConfig,
};
use crate::jobs::repo::JobsRepo;
use crate::jobs::runner::RunnerRegistry;
use crate::jobs::runs::RunsRepo;
use crate::jobs::scheduler::Scheduler;
use crate::jobs::worker::Worker;

/// Attempts at an optimistic job update before giving up with a conflict.
const UPDATE_ROUNDS: usize = 3;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Prefix for worker ids; workers are named `<prefix>-<index>`.
    pub worker_id: String,
    pub workers: usize,
    pub tick_interval: Duration,
    pub idle_sleep: Duration,
    pub due_batch: i64,
    pub retention_interval: Duration,
    pub retention: RetentionConfig,
    /// How long a runner may keep going after its deadline or a cancel.
    pub cancel_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            workers: 2,
            tick_interval: Duration::from_secs(1),
            idle_sleep: Duration::from_millis(200),
            due_batch: 200,
            retention_interval: Duration::from_secs(60 * 60),
            retention: RetentionConfig::default(),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct SharedState {
    closed: bool,
    started: bool,
    running: HashMap<Uuid, CancellationToken>,
}

/// State shared by the manager, the scheduler and the workers.
pub(crate) struct Shared {
    state: Mutex<SharedState>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) wake: Notify,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SharedState::default()),
            shutdown: CancellationToken::new(),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        // a panic while holding the lock leaves the map consistent
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Track a cancel token for `run_id`. `None` once the manager is closed.
    pub(crate) fn register(self: &Arc<Self>, run_id: Uuid) -> Option<RunGuard> {
        let mut st = self.lock();
        if st.closed {
            return None;
        }
        let token = self.shutdown.child_token();
        st.running.insert(run_id, token.clone());
        Some(RunGuard {
            shared: Arc::clone(self),
            run_id,
            token,
        })
    }

    /// Fire the token of an executing run. Returns whether one was found.
    fn cancel(&self, run_id: Uuid) -> bool {
        match self.lock().running.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn running_count(&self) -> usize {
        self.lock().running.len()
    }
}

/// Removes the run's token from the map on every exit path.
pub(crate) struct RunGuard {
    shared: Arc<Shared>,
    run_id: Uuid,
    token: CancellationToken,
}

impl RunGuard {
    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.shared.lock().running.remove(&self.run_id);
    }
}

struct Inner {
    pool: SqlitePool,
    jobs: JobsRepo,
    runs: RunsRepo,
    events: RunEventsRepo,
    maintenance: MaintenanceRepo,
    registry: RunnerRegistry,
    cfg: ManagerConfig,
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

/// Entry point for every job and run operation. Cheap to clone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Migrate the schema, requeue runs left in flight by a previous process
    /// and build a manager. Background loops start with [`Manager::start`].
    pub async fn open(
        pool: SqlitePool,
        registry: RunnerRegistry,
        cfg: ManagerConfig,
    ) -> Result<Self> {
        db::run_migrations(&pool).await?;

        let runs = RunsRepo::new(pool.clone());
        let recovered = runs.recover_in_flight(Utc::now()).await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "requeued runs left in flight");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                jobs: JobsRepo::new(pool.clone()),
                runs,
                events: RunEventsRepo::new(pool.clone()),
                maintenance: MaintenanceRepo::new(pool.clone()),
                pool,
                registry,
                cfg,
                shared: Arc::new(Shared::new()),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// Spawn the scheduler and the worker pool. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        {
            let mut st = self.inner.shared.lock();
            if st.closed {
                return Err(JobsError::Closed);
            }
            if st.started {
                return Ok(());
            }
            st.started = true;
        }

        let inner = &self.inner;
        inner.tracker.spawn(self.scheduler().run());

        let workers = inner.cfg.workers.max(1);
        for i in 0..workers {
            inner.tracker.spawn(self.worker(i + 1).run());
        }

        tracing::info!(workers, worker_id = %inner.cfg.worker_id, "scheduler and workers started");
        Ok(())
    }

    /// The scheduler driven by [`start`](Self::start), for stepping it by hand.
    pub fn scheduler(&self) -> Scheduler {
        let inner = &self.inner;
        Scheduler::new(
            inner.jobs.clone(),
            inner.runs.clone(),
            inner.maintenance.clone(),
            Arc::clone(&inner.shared),
            inner.cfg.due_batch,
            inner.cfg.tick_interval,
            inner.cfg.retention.clone(),
            inner.cfg.retention_interval,
        )
    }

    /// Worker number `index`, for stepping it by hand.
    pub fn worker(&self, index: usize) -> Worker {
        let inner = &self.inner;
        Worker::new(
            format!("{}-{}", inner.cfg.worker_id, index),
            inner.jobs.clone(),
            inner.runs.clone(),
            inner.registry.clone(),
            Arc::clone(&inner.shared),
            inner.cfg.idle_sleep,
            inner.cfg.cancel_grace,
        )
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// Runs currently executing in this process.
    pub fn executing(&self) -> usize {
        self.inner.shared.running_count()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shared.is_closed() {
            return Err(JobsError::Closed);
        }
        Ok(())
    }

    // ----------------------------
    // Jobs
    // ----------------------------

    pub async fn create_job(&self, job: NewJob) -> Result<Job> {
        self.ensure_open()?;
        let now = Utc::now();
        job.validate(now)?;

        let next_run_at = job.trigger.initial_fire(now)?;
        let created = self.inner.jobs.insert(&job, next_run_at, now).await?;

        tracing::info!(
            job_id = %created.id,
            job = %created.name,
            trigger = %created.trigger_type(),
            next_run_at = ?created.next_run_at,
            "job created"
        );
        Ok(created)
    }

    /// Apply `patch`, re-validate and recompute `next_run_at` from the
    /// resulting trigger. A `once` job that already fired stays spent unless
    /// the patch gives it a new trigger. The write only lands if nothing else
    /// touched the job since it was read; otherwise the patch is re-applied
    /// to a fresh read.
    pub async fn update_job(&self, job_id: Uuid, patch: JobPatch) -> Result<Job> {
        self.ensure_open()?;

        for _ in 0..UPDATE_ROUNDS {
            let now = Utc::now();
            let mut job = self.get_job(job_id).await?;
            let read_at = job.updated_at;
            let spent = matches!(job.trigger, TriggerConfig::Once { .. }) && job.next_run_at.is_none();
            let new_trigger = patch.trigger.is_some();

            patch.clone().apply(&mut job, now)?;
            if new_trigger || !spent {
                job.next_run_at = job.trigger.initial_fire(now)?;
            }

            if let Some(updated) = self.inner.jobs.update(&job, read_at, now).await? {
                tracing::info!(job_id = %updated.id, next_run_at = ?updated.next_run_at, "job updated");
                return Ok(updated);
            }
            tracing::debug!(%job_id, "job changed while updating, retrying");
        }

        // a job deleted meanwhile is not found, not a conflict
        self.get_job(job_id).await?;
        Err(JobsError::Conflict(format!(
            "job {job_id} kept changing while updating"
        )))
    }

    /// Delete a job with its runs and events. With `cancel_active`, in-flight
    /// runs are cancelled first so their runners stop.
    pub async fn delete_job(&self, job_id: Uuid, cancel_active: bool) -> Result<()> {
        self.ensure_open()?;

        if cancel_active {
            for run in self.inner.runs.active_for_job(job_id).await? {
                match self.cancel_run(run.id).await {
                    Ok(_) | Err(JobsError::Conflict(_)) | Err(JobsError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if !self.inner.jobs.delete(job_id).await? {
            return Err(JobsError::job_not_found(job_id));
        }
        tracing::info!(%job_id, cancel_active, "job deleted");
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.ensure_open()?;
        self.inner
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| JobsError::job_not_found(job_id))
    }

    pub async fn list_jobs(&self, page: Page) -> Result<Paged<Job>> {
        self.ensure_open()?;
        self.inner.jobs.list(page).await
    }

    /// Queue a manual run now. A `forbid` job with a run in flight is a conflict.
    pub async fn trigger_job(&self, job_id: Uuid) -> Result<Run> {
        self.ensure_open()?;
        let job = self.get_job(job_id).await?;
        let now = Utc::now();

        let run = match job.concurrency_policy {
            ConcurrencyPolicy::Forbid => self
                .inner
                .runs
                .enqueue_if_idle(job.id, 1, RunTrigger::Manual, now, now)
                .await?
                .ok_or_else(|| {
                    JobsError::Conflict(format!("job {:?} already has an active run", job.name))
                })?,
            ConcurrencyPolicy::Allow => {
                self.inner
                    .runs
                    .enqueue(job.id, 1, RunTrigger::Manual, now, now)
                    .await?
            }
        };

        self.inner.shared.wake.notify_waiters();
        tracing::info!(job_id = %job.id, run_id = %run.id, "job triggered");
        Ok(run)
    }

    pub async fn pause_job(&self, job_id: Uuid) -> Result<Job> {
        self.ensure_open()?;
        let paused = self
            .inner
            .jobs
            .disable(job_id, Utc::now())
            .await?
            .ok_or_else(|| JobsError::job_not_found(job_id))?;
        tracing::info!(%job_id, "job paused");
        Ok(paused)
    }

    /// Re-enable a job. Cron jobs resume from the next fire time after now
    /// rather than catching up on what was missed.
    pub async fn resume_job(&self, job_id: Uuid) -> Result<Job> {
        self.ensure_open()?;
        let job = self.get_job(job_id).await?;
        let now = Utc::now();

        let next_run_at = match &job.trigger {
            TriggerConfig::Cron { .. } => job.trigger.following_fire(now)?,
            TriggerConfig::Once { .. } => job.next_run_at,
            TriggerConfig::Manual => None,
        };

        let resumed = self
            .inner
            .jobs
            .enable(job.id, next_run_at, now)
            .await?
            .ok_or_else(|| JobsError::job_not_found(job_id))?;
        tracing::info!(%job_id, next_run_at = ?resumed.next_run_at, "job resumed");
        Ok(resumed)
    }

    // ----------------------------
    // Runs
    // ----------------------------

    pub async fn list_runs(&self, job_id: Option<Uuid>, page: Page) -> Result<Paged<Run>> {
        self.ensure_open()?;
        self.inner.runs.list(job_id, page).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.ensure_open()?;
        self.inner
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| JobsError::run_not_found(run_id))
    }

    pub async fn list_run_events(&self, run_id: Uuid, page: Page) -> Result<Paged<RunEvent>> {
        self.ensure_open()?;
        // 404 for unknown runs rather than an empty page
        self.get_run(run_id).await?;
        self.inner.events.list_for_run(run_id, page).await
    }

    /// Cancel a run. Queued and claimed runs are cancelled on the spot;
    /// running ones move to `cancel_requested` and their runner is signalled.
    /// Cancelling a finished run is a conflict.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        self.ensure_open()?;
        let now = Utc::now();

        // A few rounds cover a run moving between states under us.
        for _ in 0..3 {
            let run = self.get_run(run_id).await?;

            match run.status {
                s if s.is_terminal() => {
                    return Err(JobsError::Conflict(format!("run {run_id} already {s}")));
                }
                RunStatus::Queued | RunStatus::Claimed => {
                    if let Some(cancelled) = self.inner.runs.cancel_before_start(run_id, now).await? {
                        // a claiming worker may already hold a token
                        self.inner.shared.cancel(run_id);
                        tracing::info!(%run_id, from = %run.status, "run cancelled before start");
                        return Ok(cancelled);
                    }
                }
                RunStatus::Running => {
                    if let Some(run) = self.inner.runs.request_cancel(run_id, now).await? {
                        let signalled = self.inner.shared.cancel(run_id);
                        tracing::info!(%run_id, signalled, "cancel requested");
                        return Ok(run);
                    }
                }
                RunStatus::CancelRequested => {
                    self.inner.shared.cancel(run_id);
                    return Ok(run);
                }
                other => {
                    return Err(JobsError::Conflict(format!("run {run_id} is {other}")));
                }
            }
        }

        Err(JobsError::Conflict(format!(
            "run {run_id} changed state while cancelling"
        )))
    }

    // ----------------------------
    // Maintenance
    // ----------------------------

    pub async fn prune_now(&self) -> Result<PruneReport> {
        self.ensure_open()?;
        self.inner
            .maintenance
            .prune(&self.inner.cfg.retention, Utc::now())
            .await
    }

    /// Stop the loops, cancel executing runs, wait for every task and close
    /// the pool. Later calls return immediately.
    pub async fn close(&self) {
        let tokens: Vec<CancellationToken> = {
            let mut st = self.inner.shared.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.running.values().cloned().collect()
        };

        tracing::info!(executing = tokens.len(), "manager closing");
        for token in tokens {
            token.cancel();
        }
        self.inner.shared.shutdown.cancel();

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.pool.close().await;
        tracing::info!("manager closed");
    }
}
