mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{manual_job, open_manager, program_job, program_registry, setup_db};
use cronflow::jobs::{
    next_cron_time, JobPatch, JobsError, JobsRepo, Page, ProgramConfig, RunnerConfig, TriggerConfig,
};
use serde_json::json;

#[tokio::test]
async fn create_get_and_list() {
    let manager = open_manager(setup_db().await, program_registry()).await;

    for i in 0..5 {
        manager.create_job(manual_job(&format!("job-{i}"))).await.unwrap();
    }

    let page = manager.list_jobs(Page::jobs(Some(0), Some(2))).await.unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.limit, 2);

    let rest = manager.list_jobs(Page::jobs(Some(4), None)).await.unwrap();
    assert_eq!(rest.items.len(), 1);
    assert_eq!(rest.limit, Page::JOBS_DEFAULT_LIMIT);

    let job = &page.items[0];
    let fetched = manager.get_job(job.id).await.unwrap();
    assert_eq!(fetched.name, job.name);
    assert_eq!(
        fetched.runner,
        RunnerConfig::Program(ProgramConfig::new("true", &[]))
    );
}

#[tokio::test]
async fn duplicate_names_conflict() {
    let manager = open_manager(setup_db().await, program_registry()).await;
    manager.create_job(manual_job("unique")).await.unwrap();

    let err = manager.create_job(manual_job("unique")).await.unwrap_err();
    assert!(matches!(err, JobsError::Conflict(_)), "{err:?}");

    let stored = JobsRepo::new(manager.pool().clone())
        .get_by_name(" unique ")
        .await
        .unwrap();
    assert!(stored.is_some());

    let other = manager.create_job(manual_job("other")).await.unwrap();
    let err = manager
        .update_job(
            other.id,
            JobPatch {
                name: Some("unique".into()),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobsError::Conflict(_)), "{err:?}");
}

#[tokio::test]
async fn invalid_jobs_are_rejected() {
    let manager = open_manager(setup_db().await, program_registry()).await;

    let cases = vec![
        program_job("bad-cron", "true", &[], TriggerConfig::cron("61 * * * *", "UTC")),
        program_job("bad-zone", "true", &[], TriggerConfig::cron("* * * * *", "Mars/Olympus")),
        program_job("never", "true", &[], TriggerConfig::cron("0 0 30 2 *", "UTC")),
        program_job("", "true", &[], TriggerConfig::Manual),
        program_job("no-command", "", &[], TriggerConfig::Manual),
        {
            let mut j = manual_job("zero-slots");
            j.max_concurrent_runs = 0;
            j
        },
        {
            let mut j = manual_job("bad-retry");
            j.retry_policy = Some(json!({ "max_attempts": 0 }));
            j
        },
        {
            let mut j = manual_job("bad-labels");
            j.labels = json!(["a"]);
            j
        },
        {
            let mut j = manual_job("forever");
            j.timeout_seconds = i64::MAX;
            j
        },
    ];

    for new in cases {
        let name = new.name.clone();
        let err = manager.create_job(new).await.unwrap_err();
        assert!(matches!(err, JobsError::Validation(_)), "{name}: {err:?}");
    }
    assert_eq!(manager.list_jobs(Page::default()).await.unwrap().total, 0);
}

#[tokio::test]
async fn update_recomputes_next_run() {
    let manager = open_manager(setup_db().await, program_registry()).await;
    let job = manager.create_job(manual_job("switch")).await.unwrap();
    assert_eq!(job.next_run_at, None);

    let before = Utc::now();
    let updated = manager
        .update_job(
            job.id,
            JobPatch {
                trigger: Some(TriggerConfig::cron("30 4 * * *", "Europe/Berlin")),
                timeout_seconds: Some(60),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap();

    let next = updated.next_run_at.unwrap();
    assert!(next > before);
    assert_eq!(next, next_cron_time("30 4 * * *", "Europe/Berlin", before).unwrap());
    assert_eq!(updated.timeout_seconds, 60);
    assert!(updated.updated_at >= job.updated_at);

    // back to manual clears the schedule
    let manual = manager
        .update_job(
            job.id,
            JobPatch {
                trigger: Some(TriggerConfig::Manual),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(manual.next_run_at, None);

    // invalid patches leave the row untouched
    let err = manager
        .update_job(
            job.id,
            JobPatch {
                trigger: Some(TriggerConfig::cron("nope", "UTC")),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobsError::Validation(_)));
    assert_eq!(manager.get_job(job.id).await.unwrap().trigger, TriggerConfig::Manual);
}

#[tokio::test]
async fn retry_policy_can_be_cleared() {
    let manager = open_manager(setup_db().await, program_registry()).await;
    let mut new = manual_job("retrying");
    new.retry_policy = Some(json!({ "max_attempts": 4, "backoff": "exponential" }));
    let job = manager.create_job(new).await.unwrap();
    assert_eq!(job.retry_policy().max_attempts, 4);

    let cleared = manager
        .update_job(
            job.id,
            JobPatch {
                retry_policy: Some(None),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.retry_policy, None);
    assert_eq!(cleared.retry_policy().max_attempts, 1);
}

#[tokio::test]
async fn pause_and_resume() {
    let manager = open_manager(setup_db().await, program_registry()).await;
    let job = manager
        .create_job(program_job(
            "hourly",
            "true",
            &[],
            TriggerConfig::cron("0 * * * *", "UTC"),
        ))
        .await
        .unwrap();

    let paused = manager.pause_job(job.id).await.unwrap();
    assert!(!paused.enabled);
    let report = manager
        .scheduler()
        .tick(Utc::now() + ChronoDuration::hours(3))
        .await
        .unwrap();
    assert_eq!(report.due, 0);

    let before = Utc::now();
    let resumed = manager.resume_job(job.id).await.unwrap();
    assert!(resumed.enabled);
    assert_eq!(
        resumed.next_run_at,
        Some(next_cron_time("0 * * * *", "UTC", before).unwrap())
    );
}

#[tokio::test]
async fn fired_once_job_stays_spent_after_update_and_resume() {
    let manager = open_manager(setup_db().await, program_registry()).await;
    let run_at = Utc::now() - ChronoDuration::seconds(5);
    let job = manager
        .create_job(program_job("one-shot", "true", &[], TriggerConfig::Once { run_at }))
        .await
        .unwrap();

    let sched = manager.scheduler();
    assert_eq!(sched.tick(Utc::now()).await.unwrap().enqueued, 1);

    let updated = manager
        .update_job(
            job.id,
            JobPatch {
                labels: Some(json!({ "team": "ops" })),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.next_run_at, None);
    assert_eq!(updated.labels, json!({ "team": "ops" }));

    let resumed = manager.resume_job(job.id).await.unwrap();
    assert!(resumed.enabled);
    assert_eq!(resumed.next_run_at, None);

    let report = sched.tick(Utc::now() + ChronoDuration::hours(1)).await.unwrap();
    assert_eq!(report.enqueued, 0);
    assert_eq!(manager.list_runs(Some(job.id), Page::default()).await.unwrap().total, 1);

    // a new trigger re-arms it
    let later = Utc::now() + ChronoDuration::hours(2);
    let rearmed = manager
        .update_job(
            job.id,
            JobPatch {
                trigger: Some(TriggerConfig::Once { run_at: later }),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rearmed.next_run_at, Some(later));
}

#[tokio::test]
async fn stale_job_write_is_refused() {
    let manager = open_manager(setup_db().await, program_registry()).await;
    let mut job = manager.create_job(manual_job("contended")).await.unwrap();
    let repo = JobsRepo::new(manager.pool().clone());

    // someone else moved the row on since it was read
    manager.pause_job(job.id).await.unwrap();
    job.labels = json!({ "stale": true });
    let read_at = job.updated_at;
    assert!(repo.update(&job, read_at, Utc::now()).await.unwrap().is_none());

    let stored = manager.get_job(job.id).await.unwrap();
    assert!(!stored.enabled);
    assert_eq!(stored.labels, json!({}));

    // going through the manager re-reads, so the pause survives
    let updated = manager
        .update_job(
            job.id,
            JobPatch {
                labels: Some(json!({ "fresh": true })),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.enabled);
    assert_eq!(updated.labels, json!({ "fresh": true }));
}

#[tokio::test]
async fn operations_on_missing_jobs_are_not_found() {
    let manager = open_manager(setup_db().await, program_registry()).await;
    let id = uuid::Uuid::new_v4();

    assert!(matches!(manager.get_job(id).await, Err(JobsError::NotFound { .. })));
    assert!(matches!(manager.pause_job(id).await, Err(JobsError::NotFound { .. })));
    assert!(matches!(manager.resume_job(id).await, Err(JobsError::NotFound { .. })));
    assert!(matches!(manager.trigger_job(id).await, Err(JobsError::NotFound { .. })));
    assert!(matches!(
        manager.update_job(id, JobPatch::enabled(true)).await,
        Err(JobsError::NotFound { .. })
    ));
}
