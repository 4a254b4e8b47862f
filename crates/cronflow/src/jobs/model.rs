use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::cron::{next_cron_time, parse_timezone, CronSchedule};
use crate::jobs::error::{JobsError, Result};
use crate::jobs::retry::RetryPolicy;

pub const DEFAULT_TIMEOUT_SECONDS: i64 = 300;
/// Longest accepted execution timeout: seven days.
pub const MAX_TIMEOUT_SECONDS: i64 = 7 * 24 * 60 * 60;
pub const DEFAULT_MISFIRE_POLICY: &str = "skip";

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), " {:?}"), other)),
                }
            }
        }
    };
}

string_enum!(RunnerType {
    Llm => "llm",
    Program => "program",
});

string_enum!(TriggerType {
    Manual => "manual",
    Once => "once",
    Cron => "cron",
});

string_enum!(
    /// Whether a scheduled firing may start while an earlier run is still active.
    ConcurrencyPolicy {
        Forbid => "forbid",
        Allow => "allow",
    }
);

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        ConcurrencyPolicy::Forbid
    }
}

string_enum!(RunTrigger {
    Schedule => "schedule",
    Manual => "manual",
    Retry => "retry",
});

string_enum!(RunStatus {
    Queued => "queued",
    Claimed => "claimed",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
    CancelRequested => "cancel_requested",
    TimedOut => "timed_out",
    Skipped => "skipped",
});

impl RunStatus {
    pub const ACTIVE: [RunStatus; 3] = [RunStatus::Queued, RunStatus::Claimed, RunStatus::Running];

    pub const TERMINAL: [RunStatus; 5] = [
        RunStatus::Succeeded,
        RunStatus::Failed,
        RunStatus::Cancelled,
        RunStatus::TimedOut,
        RunStatus::Skipped,
    ];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

// ----------------------------
// Runner configuration
// ----------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Run `command` as `sh -c` script text; `args` follow it quoted.
    #[serde(default)]
    pub shell: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ProgramConfig {
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            shell: false,
            workdir: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub instructions: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerConfig {
    Program(ProgramConfig),
    Llm(LlmConfig),
}

impl RunnerConfig {
    pub fn runner_type(&self) -> RunnerType {
        match self {
            RunnerConfig::Program(_) => RunnerType::Program,
            RunnerConfig::Llm(_) => RunnerType::Llm,
        }
    }

    /// Decode and validate the config payload for `runner_type`.
    pub fn parse(runner_type: RunnerType, value: &Value) -> Result<Self> {
        let cfg = match runner_type {
            RunnerType::Program => {
                let cfg: ProgramConfig = serde_json::from_value(value.clone())
                    .map_err(|e| JobsError::validation(format!("runner_config: {e}")))?;
                RunnerConfig::Program(cfg)
            }
            RunnerType::Llm => {
                let cfg: LlmConfig = serde_json::from_value(value.clone())
                    .map_err(|e| JobsError::validation(format!("runner_config: {e}")))?;
                RunnerConfig::Llm(cfg)
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RunnerConfig::Program(p) if p.command.trim().is_empty() => Err(
                JobsError::validation("runner_config.command is required"),
            ),
            RunnerConfig::Llm(l) if l.instructions.trim().is_empty() => Err(
                JobsError::validation("runner_config.instructions is required"),
            ),
            _ => Ok(()),
        }
    }

    pub fn to_value(&self) -> Value {
        let v = match self {
            RunnerConfig::Program(p) => serde_json::to_value(p),
            RunnerConfig::Llm(l) => serde_json::to_value(l),
        };
        v.unwrap_or(Value::Null)
    }
}

// ----------------------------
// Trigger configuration
// ----------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerConfig {
    Manual,
    Once { run_at: DateTime<Utc> },
    Cron { expression: String, timezone: String },
}

#[derive(Deserialize)]
struct OnceRaw {
    run_at: String,
}

#[derive(Deserialize)]
struct CronRaw {
    expression: String,
    timezone: String,
}

impl TriggerConfig {
    pub fn cron(expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        TriggerConfig::Cron {
            expression: expression.into(),
            timezone: timezone.into(),
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerConfig::Manual => TriggerType::Manual,
            TriggerConfig::Once { .. } => TriggerType::Once,
            TriggerConfig::Cron { .. } => TriggerType::Cron,
        }
    }

    /// Decode and validate the config payload for `trigger_type`.
    pub fn parse(trigger_type: TriggerType, value: &Value) -> Result<Self> {
        let cfg = match trigger_type {
            TriggerType::Manual => match value {
                Value::Null => TriggerConfig::Manual,
                Value::Object(m) if m.is_empty() => TriggerConfig::Manual,
                _ => {
                    return Err(JobsError::validation(
                        "trigger_config must be empty for manual jobs",
                    ))
                }
            },
            TriggerType::Once => {
                let raw: OnceRaw = serde_json::from_value(value.clone())
                    .map_err(|e| JobsError::validation(format!("trigger_config: {e}")))?;
                let run_at = DateTime::parse_from_rfc3339(raw.run_at.trim()).map_err(|e| {
                    JobsError::validation(format!(
                        "trigger_config.run_at must be an RFC 3339 timestamp with offset: {e}"
                    ))
                })?;
                TriggerConfig::Once {
                    run_at: run_at.with_timezone(&Utc),
                }
            }
            TriggerType::Cron => {
                let raw: CronRaw = serde_json::from_value(value.clone())
                    .map_err(|e| JobsError::validation(format!("trigger_config: {e}")))?;
                TriggerConfig::Cron {
                    expression: raw.expression,
                    timezone: raw.timezone,
                }
            }
        };
        cfg.validate(Utc::now())?;
        Ok(cfg)
    }

    /// Cron expressions must parse, name a real zone, and fire within a year of `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if let TriggerConfig::Cron {
            expression,
            timezone,
        } = self
        {
            if expression.trim().is_empty() {
                return Err(JobsError::validation("trigger_config.expression is required"));
            }
            if timezone.trim().is_empty() {
                return Err(JobsError::validation("trigger_config.timezone is required"));
            }
            let schedule = CronSchedule::parse(expression)?;
            let tz = parse_timezone(timezone)?;
            schedule.next_after(&tz, now)?;
        }
        Ok(())
    }

    /// `next_run_at` for a job that has not fired yet.
    pub fn initial_fire(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            TriggerConfig::Manual => Ok(None),
            TriggerConfig::Once { run_at } => Ok(Some(*run_at)),
            TriggerConfig::Cron {
                expression,
                timezone,
            } => Ok(Some(next_cron_time(expression, timezone, now)?)),
        }
    }

    /// `next_run_at` after the job fired at `now`.
    pub fn following_fire(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            TriggerConfig::Cron {
                expression,
                timezone,
            } => Ok(Some(next_cron_time(expression, timezone, now)?)),
            TriggerConfig::Manual | TriggerConfig::Once { .. } => Ok(None),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            TriggerConfig::Manual => json!({}),
            TriggerConfig::Once { run_at } => json!({ "run_at": run_at.to_rfc3339() }),
            TriggerConfig::Cron {
                expression,
                timezone,
            } => json!({ "expression": expression, "timezone": timezone }),
        }
    }
}

// ----------------------------
// Entities
// ----------------------------

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub runner: RunnerConfig,
    pub trigger: TriggerConfig,
    pub concurrency_policy: ConcurrencyPolicy,
    pub max_concurrent_runs: i32,
    /// Raw stored policy; see [`Job::retry_policy`].
    pub retry_policy: Option<Value>,
    pub timeout_seconds: i64,
    pub misfire_policy: String,
    pub labels: Value,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn runner_type(&self) -> RunnerType {
        self.runner.runner_type()
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type()
    }

    /// Execution timeout; non-positive values fall back to five minutes and
    /// values written around validation are capped at [`MAX_TIMEOUT_SECONDS`].
    pub fn timeout(&self) -> Duration {
        let secs = if self.timeout_seconds > 0 {
            self.timeout_seconds.min(MAX_TIMEOUT_SECONDS)
        } else {
            DEFAULT_TIMEOUT_SECONDS
        };
        Duration::from_secs(secs as u64)
    }

    /// Decode the stored retry policy, falling back to defaults if it no longer parses.
    pub fn retry_policy(&self) -> RetryPolicy {
        match RetryPolicy::from_value(self.retry_policy.as_ref()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(job_id = %self.id, error = %e, "stored retry policy is invalid, using defaults");
                RetryPolicy::default()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub job_id: Uuid,
    pub attempt: i32,
    pub trigger: RunTrigger,
    pub scheduled_for: DateTime<Utc>,
    pub status: RunStatus,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub thinking: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub event_type: String,
    pub message: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

// ----------------------------
// Inputs
// ----------------------------

#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub enabled: bool,
    pub runner: RunnerConfig,
    pub trigger: TriggerConfig,
    pub concurrency_policy: ConcurrencyPolicy,
    pub max_concurrent_runs: i32,
    pub retry_policy: Option<Value>,
    pub timeout_seconds: i64,
    pub misfire_policy: String,
    pub labels: Value,
}

impl NewJob {
    pub fn new(name: impl Into<String>, runner: RunnerConfig, trigger: TriggerConfig) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            runner,
            trigger,
            concurrency_policy: ConcurrencyPolicy::Forbid,
            max_concurrent_runs: 1,
            retry_policy: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            misfire_policy: DEFAULT_MISFIRE_POLICY.to_string(),
            labels: json!({}),
        }
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        validate_fields(
            &self.name,
            &self.runner,
            &self.trigger,
            self.max_concurrent_runs,
            self.timeout_seconds,
            self.retry_policy.as_ref(),
            &self.misfire_policy,
            &self.labels,
            now,
        )
    }
}

/// Partial update. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub runner: Option<RunnerConfig>,
    pub trigger: Option<TriggerConfig>,
    pub concurrency_policy: Option<ConcurrencyPolicy>,
    pub max_concurrent_runs: Option<i32>,
    /// `Some(None)` clears the stored policy.
    pub retry_policy: Option<Option<Value>>,
    pub timeout_seconds: Option<i64>,
    pub misfire_policy: Option<String>,
    pub labels: Option<Value>,
}

impl JobPatch {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    /// Apply onto `job` and validate the result.
    pub fn apply(self, job: &mut Job, now: DateTime<Utc>) -> Result<()> {
        if let Some(v) = self.name {
            job.name = v;
        }
        if let Some(v) = self.enabled {
            job.enabled = v;
        }
        if let Some(v) = self.runner {
            job.runner = v;
        }
        if let Some(v) = self.trigger {
            job.trigger = v;
        }
        if let Some(v) = self.concurrency_policy {
            job.concurrency_policy = v;
        }
        if let Some(v) = self.max_concurrent_runs {
            job.max_concurrent_runs = v;
        }
        if let Some(v) = self.retry_policy {
            job.retry_policy = v;
        }
        if let Some(v) = self.timeout_seconds {
            job.timeout_seconds = v;
        }
        if let Some(v) = self.misfire_policy {
            job.misfire_policy = v;
        }
        if let Some(v) = self.labels {
            job.labels = v;
        }

        validate_fields(
            &job.name,
            &job.runner,
            &job.trigger,
            job.max_concurrent_runs,
            job.timeout_seconds,
            job.retry_policy.as_ref(),
            &job.misfire_policy,
            &job.labels,
            now,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn validate_fields(
    name: &str,
    runner: &RunnerConfig,
    trigger: &TriggerConfig,
    max_concurrent_runs: i32,
    timeout_seconds: i64,
    retry_policy: Option<&Value>,
    misfire_policy: &str,
    labels: &Value,
    now: DateTime<Utc>,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(JobsError::validation("name is required"));
    }
    runner.validate()?;
    trigger.validate(now)?;
    if max_concurrent_runs < 1 {
        return Err(JobsError::validation("max_concurrent_runs must be >= 1"));
    }
    if timeout_seconds > MAX_TIMEOUT_SECONDS {
        return Err(JobsError::validation(format!(
            "timeout_seconds must be <= {MAX_TIMEOUT_SECONDS}"
        )));
    }
    RetryPolicy::from_value(retry_policy)?;
    if misfire_policy.trim().is_empty() {
        return Err(JobsError::validation("misfire_policy must not be empty"));
    }
    if !labels.is_object() {
        return Err(JobsError::validation("labels must be a JSON object"));
    }
    Ok(())
}

// ----------------------------
// Pagination
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub const JOBS_DEFAULT_LIMIT: i64 = 50;
    pub const JOBS_MAX_LIMIT: i64 = 200;
    pub const EVENTS_DEFAULT_LIMIT: i64 = 200;
    pub const EVENTS_MAX_LIMIT: i64 = 500;

    /// Missing or non-positive limits get `default`, large ones are capped at `max`.
    pub fn new(offset: Option<i64>, limit: Option<i64>, default: i64, max: i64) -> Self {
        let limit = match limit {
            Some(l) if l > 0 => l.min(max),
            _ => default,
        };
        Self {
            offset: offset.unwrap_or(0).max(0),
            limit,
        }
    }

    pub fn jobs(offset: Option<i64>, limit: Option<i64>) -> Self {
        Self::new(offset, limit, Self::JOBS_DEFAULT_LIMIT, Self::JOBS_MAX_LIMIT)
    }

    pub fn events(offset: Option<i64>, limit: Option<i64>) -> Self {
        Self::new(offset, limit, Self::EVENTS_DEFAULT_LIMIT, Self::EVENTS_MAX_LIMIT)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::jobs(None, None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

// ----------------------------
// Row scanning
// ----------------------------

fn decode_err(column: &str, source: impl Into<sqlx::error::BoxDynError>) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: source.into(),
    }
}

fn parse_col<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> sqlx::Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| decode_err(column, e))
}

fn json_col(row: &SqliteRow, column: &str) -> sqlx::Result<Value> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| decode_err(column, e))
}

impl<'r> FromRow<'r, SqliteRow> for Job {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let runner_type: RunnerType = parse_col(row, "runner_type")?;
        let runner_raw = json_col(row, "runner_config")?;
        let runner = RunnerConfig::parse(runner_type, &runner_raw)
            .map_err(|e| decode_err("runner_config", e))?;

        let trigger_type: TriggerType = parse_col(row, "trigger_type")?;
        let trigger_raw = json_col(row, "trigger_config")?;
        let trigger = decode_trigger(trigger_type, &trigger_raw)
            .map_err(|e| decode_err("trigger_config", e))?;

        let retry_raw: Option<String> = row.try_get("retry_policy")?;
        let retry_policy = retry_raw
            .map(|s| serde_json::from_str::<Value>(&s))
            .transpose()
            .map_err(|e| decode_err("retry_policy", e))?;

        Ok(Job {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            enabled: row.try_get("enabled")?,
            runner,
            trigger,
            concurrency_policy: parse_col(row, "concurrency_policy")?,
            max_concurrent_runs: row.try_get("max_concurrent_runs")?,
            retry_policy,
            timeout_seconds: row.try_get("timeout_seconds")?,
            misfire_policy: row.try_get("misfire_policy")?,
            labels: json_col(row, "labels")?,
            next_run_at: row.try_get("next_run_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Stored trigger configs were validated on write; cron expressions are
/// re-parsed on read but not required to fire again (an expired horizon must
/// not make the row unreadable).
fn decode_trigger(trigger_type: TriggerType, value: &Value) -> Result<TriggerConfig> {
    match trigger_type {
        TriggerType::Cron => {
            let raw: CronRaw = serde_json::from_value(value.clone())?;
            Ok(TriggerConfig::Cron {
                expression: raw.expression,
                timezone: raw.timezone,
            })
        }
        other => TriggerConfig::parse(other, value),
    }
}

impl<'r> FromRow<'r, SqliteRow> for Run {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Run {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            attempt: row.try_get("attempt")?,
            trigger: parse_col(row, "run_trigger")?,
            scheduled_for: row.try_get("scheduled_for")?,
            status: parse_col(row, "status")?,
            worker_id: row.try_get("worker_id")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            exit_code: row.try_get("exit_code")?,
            error: row.try_get("error")?,
            stdout: row.try_get("stdout")?,
            stderr: row.try_get("stderr")?,
            thinking: row.try_get("thinking")?,
            response: row.try_get("response")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for RunEvent {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(RunEvent {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            event_type: row.try_get("event_type")?,
            message: row.try_get("message")?,
            data: json_col(row, "data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_text() {
        for s in RunStatus::ACTIVE.iter().chain(RunStatus::TERMINAL.iter()) {
            assert_eq!(s.as_str().parse::<RunStatus>().unwrap(), *s);
        }
        assert_eq!(
            "cancel_requested".parse::<RunStatus>().unwrap(),
            RunStatus::CancelRequested
        );
        assert!("paused".parse::<RunStatus>().is_err());
        assert!(!RunStatus::CancelRequested.is_active());
        assert!(!RunStatus::CancelRequested.is_terminal());
    }

    #[test]
    fn program_config_requires_command() {
        let err = RunnerConfig::parse(RunnerType::Program, &json!({"command": " "})).unwrap_err();
        assert!(matches!(err, JobsError::Validation(_)));

        let ok = RunnerConfig::parse(RunnerType::Program, &json!({"command": "echo", "args": ["hi"]}))
            .unwrap();
        assert_eq!(ok, RunnerConfig::Program(ProgramConfig::new("echo", &["hi"])));
    }

    #[test]
    fn llm_config_requires_instructions() {
        assert!(RunnerConfig::parse(RunnerType::Llm, &json!({"agent": "default"})).is_err());
        assert!(RunnerConfig::parse(RunnerType::Llm, &json!({"instructions": "summarise"})).is_ok());
    }

    #[test]
    fn once_requires_explicit_offset() {
        assert!(TriggerConfig::parse(TriggerType::Once, &json!({"run_at": "2026-05-01T10:00:00"}))
            .is_err());
        let t = TriggerConfig::parse(
            TriggerType::Once,
            &json!({"run_at": "2026-05-01T12:00:00+02:00"}),
        )
        .unwrap();
        let TriggerConfig::Once { run_at } = t else {
            panic!("expected once trigger");
        };
        assert_eq!(run_at.to_rfc3339(), "2026-05-01T10:00:00+00:00");
    }

    #[test]
    fn cron_trigger_validates_expression_and_zone() {
        assert!(TriggerConfig::parse(
            TriggerType::Cron,
            &json!({"expression": "0 0 * * *", "timezone": "UTC"})
        )
        .is_ok());
        assert!(TriggerConfig::parse(
            TriggerType::Cron,
            &json!({"expression": "0 0 * *", "timezone": "UTC"})
        )
        .is_err());
        assert!(TriggerConfig::parse(
            TriggerType::Cron,
            &json!({"expression": "0 0 * * *", "timezone": "Nowhere/Else"})
        )
        .is_err());
        assert!(TriggerConfig::parse(TriggerType::Cron, &json!({"expression": "0 0 * * *"})).is_err());
        assert!(TriggerConfig::parse(
            TriggerType::Cron,
            &json!({"expression": "0 0 30 2 *", "timezone": "UTC"})
        )
        .is_err());
    }

    #[test]
    fn manual_trigger_rejects_config() {
        assert!(TriggerConfig::parse(TriggerType::Manual, &json!({})).is_ok());
        assert!(TriggerConfig::parse(TriggerType::Manual, &Value::Null).is_ok());
        assert!(TriggerConfig::parse(TriggerType::Manual, &json!({"run_at": "x"})).is_err());
    }

    #[test]
    fn page_defaults_and_caps() {
        assert_eq!(Page::jobs(None, None), Page { offset: 0, limit: 50 });
        assert_eq!(Page::jobs(Some(-3), Some(1000)), Page { offset: 0, limit: 200 });
        assert_eq!(Page::events(Some(10), None), Page { offset: 10, limit: 200 });
        assert_eq!(Page::events(None, Some(900)).limit, 500);
        assert_eq!(Page::jobs(None, Some(0)).limit, 50);
    }

    #[test]
    fn patch_revalidates() {
        let now = Utc::now();
        let mut job = Job {
            id: Uuid::new_v4(),
            name: "j".into(),
            enabled: true,
            runner: RunnerConfig::Program(ProgramConfig::new("true", &[])),
            trigger: TriggerConfig::Manual,
            concurrency_policy: ConcurrencyPolicy::Forbid,
            max_concurrent_runs: 1,
            retry_policy: None,
            timeout_seconds: 0,
            misfire_policy: DEFAULT_MISFIRE_POLICY.into(),
            labels: json!({}),
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(job.timeout(), Duration::from_secs(300));

        job.timeout_seconds = i64::MAX;
        assert_eq!(job.timeout(), Duration::from_secs(MAX_TIMEOUT_SECONDS as u64));

        let patch = JobPatch {
            timeout_seconds: Some(MAX_TIMEOUT_SECONDS + 1),
            ..JobPatch::default()
        };
        assert!(matches!(patch.apply(&mut job, now), Err(JobsError::Validation(_))));

        let patch = JobPatch {
            name: Some("  ".into()),
            ..JobPatch::default()
        };
        assert!(patch.apply(&mut job, now).is_err());
    }
}
