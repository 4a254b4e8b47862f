use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::jobs::error::{JobsError, Result};
use crate::jobs::manager::Shared;
use crate::jobs::model::{ConcurrencyPolicy, Job, Run, RunStatus, RunTrigger, MAX_TIMEOUT_SECONDS};
use crate::jobs::repo::JobsRepo;
use crate::jobs::runner::{RunContext, RunResult, Runner, RunnerRegistry};
use crate::jobs::runs::{RunOutcome, RunsRepo};

const FINISH_RETRIES: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// `start + timeout`, saturating far in the future instead of overflowing.
fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + Duration::from_secs(MAX_TIMEOUT_SECONDS as u64))
}

/// 9999-12-31T23:59:59Z, the last instant whose stored text still sorts
/// correctly against other timestamps.
fn latest_instant() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// When a retry delayed by `delay` becomes claimable. Oversized delays
/// saturate at [`latest_instant`], never at `now`.
fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let latest = latest_instant();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or(latest, |at| at.min(latest))
}

/// One claim-and-execute loop. The manager spawns several, each with its own id.
#[derive(Clone)]
pub struct Worker {
    id: String,
    jobs: JobsRepo,
    runs: RunsRepo,
    registry: RunnerRegistry,
    shared: Arc<Shared>,
    idle_sleep: Duration,
    cancel_grace: Duration,
}

impl Worker {
    pub(crate) fn new(
        id: String,
        jobs: JobsRepo,
        runs: RunsRepo,
        registry: RunnerRegistry,
        shared: Arc<Shared>,
        idle_sleep: Duration,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            id,
            jobs,
            runs,
            registry,
            shared,
            idle_sleep,
            cancel_grace,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) async fn run(self) {
        tracing::info!(worker_id = %self.id, "worker started");
        let shutdown = self.shared.shutdown.clone();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_one().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::warn!(worker_id = %self.id, error = %e, "worker iteration failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(self.idle_sleep) => {}
            }
        }

        tracing::info!(worker_id = %self.id, "worker stopped");
    }

    /// Claim and execute at most one run. Returns whether a run was claimed.
    pub async fn run_one(&self) -> Result<bool> {
        if self.shared.is_closed() {
            return Ok(false);
        }

        let Some(run) = self.runs.claim(&self.id, Utc::now()).await? else {
            return Ok(false);
        };

        let span = tracing::info_span!(
            "run",
            worker_id = %self.id,
            run_id = %run.id,
            job_id = %run.job_id,
            attempt = run.attempt
        );
        self.execute(run).instrument(span).await?;
        Ok(true)
    }

    async fn execute(&self, run: Run) -> Result<()> {
        // 1) register the cancel token before the run becomes visible as running
        let Some(guard) = self.shared.register(run.id) else {
            // shutting down; recovery requeues the claimed run on next open
            return Ok(());
        };

        // 2) load the job; a deleted job takes its runs with it
        let job = match self.jobs.get(run.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!("job vanished before start");
                return Ok(());
            }
            Err(e) => return self.abandon(run.id, "load job", e).await,
        };

        // 3) claimed -> running
        let run = match self.runs.mark_running(run.id, Utc::now()).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                tracing::info!("run cancelled before start");
                return Ok(());
            }
            Err(e) => return self.abandon(run.id, "start run", e).await,
        };

        // 4) resolve the runner
        let Some(runner) = self.registry.runner_for(job.runner_type()) else {
            let msg = format!("no runner registered for {}", job.runner_type());
            tracing::warn!(error = %msg, "run failed");
            let status = self
                .record(run.id, &RunOutcome::bare(RunStatus::Failed, Some(msg)))
                .await?;
            if let Some(status) = status {
                self.after_finish(&run, &job, status).await?;
            }
            return Ok(());
        };

        // 5) execute under deadline and cancellation
        let timeout = job.timeout();
        let started = Instant::now();
        let ctx = RunContext {
            run_id: run.id,
            attempt: run.attempt,
            cancel: guard.token(),
            deadline: deadline_after(started, timeout),
        };
        let outcome = self.drive(runner.as_ref(), &ctx, &job, timeout).await;

        // 6) record and maybe retry
        let status = match self.record(run.id, &outcome).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, status = %outcome.status, "could not record run outcome");
                let fallback =
                    RunOutcome::bare(RunStatus::Failed, Some(format!("record outcome: {e}")));
                self.record(run.id, &fallback).await?
            }
        };
        drop(guard);
        let Some(status) = status else {
            tracing::debug!("run row gone before finish");
            return Ok(());
        };

        tracing::info!(
            status = %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run finished"
        );
        self.after_finish(&run, &job, status).await
    }

    /// `finish` with a few retries for transient store errors.
    async fn record(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<Option<RunStatus>> {
        let mut attempt = 0;
        loop {
            match self.runs.finish(run_id, outcome, Utc::now()).await {
                Ok(status) => return Ok(status),
                Err(e) if attempt < FINISH_RETRIES => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, "finish failed, retrying");
                    tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A store error interrupted the run before it executed: fail it so it
    /// does not stay active. Not retried, since the job could not be read.
    async fn abandon(&self, run_id: Uuid, step: &str, err: JobsError) -> Result<()> {
        tracing::error!(error = %err, step, "store error before execution");
        let outcome = RunOutcome::bare(RunStatus::Failed, Some(format!("{step}: {err}")));
        match self.record(run_id, &outcome).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "could not fail the run, leaving it to recovery");
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        runner: &dyn Runner,
        ctx: &RunContext,
        job: &Job,
        timeout: Duration,
    ) -> RunOutcome {
        let fut = runner.run(ctx, job);
        tokio::pin!(fut);

        let mut timed_out = false;
        let first = tokio::select! {
            res = &mut fut => Some(res),
            _ = tokio::time::sleep_until(ctx.deadline) => {
                timed_out = true;
                None
            }
            _ = ctx.cancel.cancelled() => None,
        };

        // Deadline or cancel: ask the runner to stop and give it a grace period.
        let res = match first {
            Some(res) => Some(res),
            None => {
                ctx.cancel.cancel();
                tokio::time::timeout(self.cancel_grace, &mut fut).await.ok()
            }
        };

        let (output, runner_error) = match res {
            Some(Ok(out)) => (out, None),
            Some(Err(e)) => (e.output, Some(e.message)),
            None => (RunResult::default(), None),
        };

        let status = if timed_out {
            RunStatus::TimedOut
        } else if ctx.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if runner_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        // The runner's own message is kept; one is made up only when it had none.
        let error = match (runner_error, status) {
            (Some(msg), _) => Some(msg),
            (None, RunStatus::TimedOut) => Some(format!("timed out after {}s", timeout.as_secs())),
            (None, RunStatus::Cancelled) => Some("cancelled".to_string()),
            (None, _) => None,
        };

        RunOutcome {
            status,
            exit_code: output.exit_code,
            error,
            stdout: output.stdout,
            stderr: output.stderr,
            thinking: output.thinking,
            response: output.response,
        }
    }

    /// Queue the next attempt of a failed or timed out run when the policy allows it.
    async fn after_finish(&self, run: &Run, job: &Job, status: RunStatus) -> Result<()> {
        if !matches!(status, RunStatus::Failed | RunStatus::TimedOut) {
            return Ok(());
        }

        let policy = job.retry_policy();
        if !policy.should_retry(run.attempt) {
            return Ok(());
        }

        let delay = {
            let mut rng = rand::thread_rng();
            policy.jittered_delay_for(run.attempt, &mut rng)
        };
        let now = Utc::now();
        let scheduled_for = retry_at(now, delay);
        let next_attempt = run.attempt + 1;

        let retry = match job.concurrency_policy {
            ConcurrencyPolicy::Forbid => {
                self.runs
                    .enqueue_if_idle(job.id, next_attempt, RunTrigger::Retry, scheduled_for, now)
                    .await?
            }
            ConcurrencyPolicy::Allow => Some(
                self.runs
                    .enqueue(job.id, next_attempt, RunTrigger::Retry, scheduled_for, now)
                    .await?,
            ),
        };

        let Some(retry) = retry else {
            tracing::info!("retry skipped, job already has an active run");
            return Ok(());
        };

        self.runs
            .note_retry(run.id, retry.id, next_attempt, scheduled_for, now)
            .await?;
        tracing::info!(
            retry_run_id = %retry.id,
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        Ok(())
    }
}
