use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::error::{JobsError, Result};
use crate::jobs::model::{
    ConcurrencyPolicy, Job, JobPatch, NewJob, Paged, RunnerConfig, RunnerType, TriggerConfig,
    TriggerType, DEFAULT_MISFIRE_POLICY, DEFAULT_TIMEOUT_SECONDS,
};

/// Wire shape of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub runner_type: RunnerType,
    pub runner_config: Value,
    pub trigger_type: TriggerType,
    pub trigger_config: Value,
    pub concurrency_policy: ConcurrencyPolicy,
    pub max_concurrent_runs: i32,
    pub retry_policy: Option<Value>,
    pub timeout_seconds: i64,
    pub misfire_policy: String,
    pub labels: Value,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            runner_type: job.runner_type(),
            runner_config: job.runner.to_value(),
            trigger_type: job.trigger_type(),
            trigger_config: job.trigger.to_value(),
            name: job.name,
            enabled: job.enabled,
            concurrency_policy: job.concurrency_policy,
            max_concurrent_runs: job.max_concurrent_runs,
            retry_policy: job.retry_policy,
            timeout_seconds: job.timeout_seconds,
            misfire_policy: job.misfire_policy,
            labels: job.labels,
            next_run_at: job.next_run_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

pub fn paged_jobs(page: Paged<Job>) -> Paged<JobView> {
    Paged {
        items: page.items.into_iter().map(JobView::from).collect(),
        total: page.total,
        offset: page.offset,
        limit: page.limit,
    }
}

fn default_true() -> bool {
    true
}

/// Absent stays `None`; an explicit `null` becomes `Some(Value::Null)`.
fn present<'de, D>(d: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(d).map(Some)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateJobRequest {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub runner_type: RunnerType,
    pub runner_config: Value,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Value,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    pub max_concurrent_runs: Option<i32>,
    pub retry_policy: Option<Value>,
    pub timeout_seconds: Option<i64>,
    pub misfire_policy: Option<String>,
    pub labels: Option<Value>,
}

impl CreateJobRequest {
    pub fn into_new_job(self) -> Result<NewJob> {
        let runner = RunnerConfig::parse(self.runner_type, &self.runner_config)?;
        let trigger = TriggerConfig::parse(self.trigger_type, &self.trigger_config)?;

        Ok(NewJob {
            name: self.name,
            enabled: self.enabled,
            runner,
            trigger,
            concurrency_policy: self.concurrency_policy,
            max_concurrent_runs: self.max_concurrent_runs.unwrap_or(1),
            retry_policy: self.retry_policy.filter(|v| !v.is_null()),
            timeout_seconds: self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            misfire_policy: self
                .misfire_policy
                .unwrap_or_else(|| DEFAULT_MISFIRE_POLICY.to_string()),
            labels: self.labels.unwrap_or_else(|| serde_json::json!({})),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub runner_type: Option<RunnerType>,
    pub runner_config: Option<Value>,
    pub trigger_type: Option<TriggerType>,
    pub trigger_config: Option<Value>,
    pub concurrency_policy: Option<ConcurrencyPolicy>,
    pub max_concurrent_runs: Option<i32>,
    #[serde(default, deserialize_with = "present")]
    pub retry_policy: Option<Value>,
    pub timeout_seconds: Option<i64>,
    pub misfire_policy: Option<String>,
    pub labels: Option<Value>,
}

impl UpdateJobRequest {
    /// Build a patch against `current`. Changing a runner or trigger type
    /// requires the matching config; a config alone keeps the current type.
    pub fn into_patch(self, current: &Job) -> Result<JobPatch> {
        let runner = match (self.runner_type, self.runner_config) {
            (None, None) => None,
            (Some(t), Some(cfg)) => Some(RunnerConfig::parse(t, &cfg)?),
            (None, Some(cfg)) => Some(RunnerConfig::parse(current.runner_type(), &cfg)?),
            (Some(t), None) if t == current.runner_type() => None,
            (Some(_), None) => {
                return Err(JobsError::validation(
                    "runner_config is required when changing runner_type",
                ))
            }
        };

        let trigger = match (self.trigger_type, self.trigger_config) {
            (None, None) => None,
            (Some(t), Some(cfg)) => Some(TriggerConfig::parse(t, &cfg)?),
            (None, Some(cfg)) => Some(TriggerConfig::parse(current.trigger_type(), &cfg)?),
            (Some(TriggerType::Manual), None) => Some(TriggerConfig::Manual),
            (Some(t), None) if t == current.trigger_type() => None,
            (Some(_), None) => {
                return Err(JobsError::validation(
                    "trigger_config is required when changing trigger_type",
                ))
            }
        };

        Ok(JobPatch {
            name: self.name,
            enabled: self.enabled,
            runner,
            trigger,
            concurrency_policy: self.concurrency_policy,
            max_concurrent_runs: self.max_concurrent_runs,
            retry_policy: self.retry_policy.map(|v| Some(v).filter(|v| !v.is_null())),
            timeout_seconds: self.timeout_seconds,
            misfire_policy: self.misfire_policy,
            labels: self.labels,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRunsQuery {
    pub job_id: Option<Uuid>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteJobQuery {
    #[serde(default)]
    pub cancel_active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
