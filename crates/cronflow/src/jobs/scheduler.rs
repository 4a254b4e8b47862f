use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::jobs::error::Result;
use crate::jobs::maintenance::{MaintenanceRepo, PruneReport, RetentionConfig};
use crate::jobs::manager::Shared;
use crate::jobs::model::{ConcurrencyPolicy, Job, RunTrigger, TriggerConfig};
use crate::jobs::repo::JobsRepo;
use crate::jobs::runs::RunsRepo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub enqueued: usize,
    /// Due firings dropped because a `forbid` job still had a run in flight.
    pub skipped: usize,
    pub errors: usize,
}

/// Turns due jobs into queued runs. One instance runs per manager.
#[derive(Clone)]
pub struct Scheduler {
    jobs: JobsRepo,
    runs: RunsRepo,
    maintenance: MaintenanceRepo,
    shared: Arc<Shared>,
    due_batch: i64,
    tick_interval: Duration,
    retention: RetentionConfig,
    retention_interval: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        jobs: JobsRepo,
        runs: RunsRepo,
        maintenance: MaintenanceRepo,
        shared: Arc<Shared>,
        due_batch: i64,
        tick_interval: Duration,
        retention: RetentionConfig,
        retention_interval: Duration,
    ) -> Self {
        Self {
            jobs,
            runs,
            maintenance,
            shared,
            due_batch,
            tick_interval,
            retention,
            retention_interval,
        }
    }

    pub(crate) async fn run(self) {
        tracing::info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            "scheduler started"
        );
        let shutdown = self.shared.shutdown.clone();
        let mut last_prune: Option<Instant> = None;

        loop {
            match self.tick(Utc::now()).await {
                Ok(report) if report.enqueued > 0 || report.errors > 0 => {
                    tracing::debug!(?report, "scheduler tick");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "scheduler tick failed"),
            }

            if last_prune.map_or(true, |t| t.elapsed() >= self.retention_interval) {
                last_prune = Some(Instant::now());
                match self.prune(Utc::now()).await {
                    Ok(r) if r.total() > 0 => tracing::info!(
                        runs_expired = r.runs_expired,
                        runs_over_cap = r.runs_over_cap,
                        events_expired = r.events_expired,
                        "retention sweep"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "retention sweep failed"),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
        }

        tracing::info!("scheduler stopped");
    }

    /// Enqueue runs for every job due at `now`. Failures are isolated per job.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.jobs.due(now, self.due_batch).await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for job in &due {
            match self.fire(job, now).await {
                Ok(true) => report.enqueued += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(job_id = %job.id, job = %job.name, error = %e, "failed to schedule job");
                }
            }
        }

        if report.enqueued > 0 {
            self.shared.wake.notify_waiters();
        }
        Ok(report)
    }

    pub async fn prune(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        self.maintenance.prune(&self.retention, now).await
    }

    async fn fire(&self, job: &Job, now: DateTime<Utc>) -> Result<bool> {
        // 1) where the schedule goes next
        let next = match job.trigger.following_fire(now) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "cron schedule has no next fire time");
                None
            }
        };

        // 2) enqueue, honouring the concurrency policy
        let run = match job.concurrency_policy {
            ConcurrencyPolicy::Forbid => {
                self.runs
                    .enqueue_if_idle(job.id, 1, RunTrigger::Schedule, now, now)
                    .await?
            }
            ConcurrencyPolicy::Allow => Some(
                self.runs
                    .enqueue(job.id, 1, RunTrigger::Schedule, now, now)
                    .await?,
            ),
        };

        // 3) advance; one-shot jobs switch themselves off once fired
        let fired = run.is_some();
        let disable = fired && matches!(job.trigger, TriggerConfig::Once { .. });
        self.jobs.advance(job.id, next, disable, now).await?;

        match run {
            Some(run) => tracing::info!(job_id = %job.id, job = %job.name, run_id = %run.id, "job fired"),
            None => tracing::info!(job_id = %job.id, job = %job.name, "firing skipped, previous run still active"),
        }
        Ok(fired)
    }
}
