use std::time::Duration;

use crate::db::PoolConfig;
use crate::jobs::maintenance::RetentionConfig;
use crate::jobs::manager::ManagerConfig;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://cronflow.db";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Runtime configuration, read from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub worker_id: String,
    pub workers: usize,
    pub tick_interval_ms: u64,
    pub idle_sleep_ms: u64,
    pub due_batch: i64,
    pub retention_interval_secs: u64,
    pub retention: RetentionConfig,
    pub admin_addr: Option<String>,
    pub agent_command: Option<String>,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |primary: &str, fallback: &str| {
            get(primary)
                .filter(|s| !s.trim().is_empty())
                .or_else(|| get(fallback).filter(|s| !s.trim().is_empty()))
        };

        let database_url = var("DATABASE_URL", "CRONFLOW_DATABASE_URL")
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let db_max_connections = parse_or(
            var("CRONFLOW_DB_MAX_CONNECTIONS", "DB_MAX_CONNECTIONS"),
            "CRONFLOW_DB_MAX_CONNECTIONS",
            4,
        )?;

        let worker_id = var("CRONFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| get("HOSTNAME").filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| "worker".to_string());

        let workers: usize = parse_or(var("CRONFLOW_WORKERS", "WORKERS"), "CRONFLOW_WORKERS", 2)?;
        let tick_interval_ms = parse_or(
            var("CRONFLOW_TICK_INTERVAL_MS", "TICK_INTERVAL_MS"),
            "CRONFLOW_TICK_INTERVAL_MS",
            1000,
        )?;
        let idle_sleep_ms = parse_or(
            var("CRONFLOW_IDLE_SLEEP_MS", "IDLE_SLEEP_MS"),
            "CRONFLOW_IDLE_SLEEP_MS",
            200,
        )?;
        let due_batch = parse_or(
            var("CRONFLOW_DUE_BATCH", "DUE_BATCH"),
            "CRONFLOW_DUE_BATCH",
            200,
        )?;

        let retention_interval_secs = parse_or(
            var("CRONFLOW_RETENTION_INTERVAL_SECS", "RETENTION_INTERVAL_SECS"),
            "CRONFLOW_RETENTION_INTERVAL_SECS",
            3600,
        )?;
        let defaults = RetentionConfig::default();
        let retention = RetentionConfig {
            run_days: parse_or(
                var("CRONFLOW_RETENTION_RUN_DAYS", "RETENTION_RUN_DAYS"),
                "CRONFLOW_RETENTION_RUN_DAYS",
                defaults.run_days,
            )?,
            max_runs_per_job: parse_or(
                var("CRONFLOW_RETENTION_MAX_RUNS_PER_JOB", "RETENTION_MAX_RUNS_PER_JOB"),
                "CRONFLOW_RETENTION_MAX_RUNS_PER_JOB",
                defaults.max_runs_per_job,
            )?,
            event_days: parse_or(
                var("CRONFLOW_RETENTION_EVENT_DAYS", "RETENTION_EVENT_DAYS"),
                "CRONFLOW_RETENTION_EVENT_DAYS",
                defaults.event_days,
            )?,
        };

        let admin_addr =
            var("CRONFLOW_ADMIN_ADDR", "ADMIN_ADDR").and_then(|s| normalize_optional_addr(&s));

        let agent_command = var("CRONFLOW_AGENT_COMMAND", "AGENT_COMMAND");

        let log_format = match var("CRONFLOW_LOG_FORMAT", "LOG_FORMAT")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            None | Some("text") | Some("pretty") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => anyhow::bail!("CRONFLOW_LOG_FORMAT must be text or json, got {other:?}"),
        };

        Ok(Self {
            database_url,
            db_max_connections,
            worker_id,
            workers,
            tick_interval_ms,
            idle_sleep_ms,
            due_batch,
            retention_interval_secs,
            retention,
            admin_addr,
            agent_command,
            log_format,
        })
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.db_max_connections,
            ..PoolConfig::default()
        }
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            worker_id: self.worker_id.clone(),
            workers: self.workers.max(1),
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            idle_sleep: Duration::from_millis(self.idle_sleep_ms.max(1)),
            due_batch: self.due_batch.max(1),
            retention_interval: Duration::from_secs(self.retention_interval_secs.max(1)),
            retention: self.retention.clone(),
            ..ManagerConfig::default()
        }
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}={raw:?} is invalid: {e}")),
    }
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
