pub mod cron;
pub mod error;
pub mod events;
pub mod maintenance;
pub mod manager;
pub mod model;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod runners;
pub mod runs;
pub mod scheduler;
pub mod worker;

pub use cron::{next_cron_time, CronError, CronSchedule};
pub use error::{JobsError, Result};
pub use events::{EventType, RunEventsRepo};
pub use maintenance::{cutoff_days, MaintenanceRepo, PruneReport, RetentionConfig};
pub use manager::{Manager, ManagerConfig};
pub use model::{
    ConcurrencyPolicy, Job, JobPatch, LlmConfig, NewJob, Page, Paged, ProgramConfig, Run,
    RunEvent, RunStatus, RunTrigger, RunnerConfig, RunnerType, TriggerConfig, TriggerType,
};
pub use repo::JobsRepo;
pub use retry::{Backoff, RetryPolicy};
pub use runner::{RunContext, RunResult, Runner, RunnerError, RunnerRegistry};
pub use runs::{RunOutcome, RunsRepo};
pub use scheduler::{Scheduler, TickReport};
pub use worker::Worker;
