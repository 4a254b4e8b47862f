use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::Instant;

use crate::jobs::model::{Job, ProgramConfig, RunnerConfig};
use crate::jobs::runner::{RunContext, RunResult, Runner, RunnerError};

/// Per-stream capture limit.
const MAX_OUTPUT_BYTES: usize = 256 * 1024;

/// Runs `program` jobs as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProgramRunner;

impl ProgramRunner {
    pub fn new() -> Self {
        Self
    }

    /// In shell mode `command` is script text and each arg is passed as one
    /// literal word after it.
    fn command(cfg: &ProgramConfig) -> Command {
        let mut cmd = if cfg.shell {
            let mut line = cfg.command.clone();
            for arg in &cfg.args {
                line.push(' ');
                line.push_str(&shell_quote(arg));
            }
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        } else {
            let mut cmd = Command::new(&cfg.command);
            cmd.args(&cfg.args);
            cmd
        };

        if let Some(dir) = cfg.workdir.as_deref().filter(|d| !d.trim().is_empty()) {
            cmd.current_dir(dir);
        }
        cmd.envs(&cfg.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Single-quote `arg` for `sh`.
fn shell_quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

fn capture(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[async_trait]
impl Runner for ProgramRunner {
    async fn run(&self, ctx: &RunContext, job: &Job) -> Result<RunResult, RunnerError> {
        let RunnerConfig::Program(cfg) = &job.runner else {
            return Err(RunnerError::new("program runner received a non-program job"));
        };

        tracing::debug!(
            run_id = %ctx.run_id,
            command = %cfg.command,
            shell = cfg.shell,
            "spawning program"
        );

        let child = Self::command(cfg)
            .spawn()
            .map_err(|e| RunnerError::new(format!("failed to start {:?}: {e}", cfg.command)))?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            out = child.wait_with_output() => {
                out.map_err(|e| RunnerError::new(format!("failed to wait for {:?}: {e}", cfg.command)))?
            }
            _ = ctx.cancel.cancelled() => {
                let reason = if Instant::now() >= ctx.deadline {
                    "deadline exceeded"
                } else {
                    "cancelled"
                };
                return Err(RunnerError::new(reason));
            }
        };

        let result = RunResult {
            exit_code: output.status.code(),
            stdout: capture(&output.stdout),
            stderr: capture(&output.stderr),
            ..RunResult::default()
        };

        if output.status.success() {
            return Ok(result);
        }

        let message = match output.status.code() {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        Err(RunnerError::with_output(message, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{ConcurrencyPolicy, TriggerConfig};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn job(cfg: ProgramConfig) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            name: "program".into(),
            enabled: true,
            runner: RunnerConfig::Program(cfg),
            trigger: TriggerConfig::Manual,
            concurrency_policy: ConcurrencyPolicy::Forbid,
            max_concurrent_runs: 1,
            retry_policy: None,
            timeout_seconds: 30,
            misfire_policy: "skip".into(),
            labels: json!({}),
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn ctx() -> RunContext {
        RunContext {
            run_id: Uuid::new_v4(),
            attempt: 1,
            cancel: CancellationToken::new(),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = ProgramRunner::new()
            .run(&ctx(), &job(ProgramConfig::new("echo", &["hi"])))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "hi\n");
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_output() {
        let mut cfg = ProgramConfig::new("echo partial; echo oops >&2; exit 3", &[]);
        cfg.shell = true;
        let err = ProgramRunner::new().run(&ctx(), &job(cfg)).await.unwrap_err();
        assert_eq!(err.message, "exit status 3");
        assert_eq!(err.output.exit_code, Some(3));
        assert_eq!(err.output.stdout, "partial\n");
        assert_eq!(err.output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn shell_mode_expands_the_command_but_not_args() {
        let mut cfg = ProgramConfig::new("printf '%s|' $GREETING", &["big  world", "$HOME", "it's"]);
        cfg.shell = true;
        cfg.env.insert("GREETING".into(), "hello".into());
        let out = ProgramRunner::new().run(&ctx(), &job(cfg)).await.unwrap();
        assert_eq!(out.stdout, "hello|big  world|$HOME|it's|");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn passed_deadline_is_reported() {
        let ctx = RunContext {
            deadline: Instant::now(),
            ..ctx()
        };
        ctx.cancel.cancel();
        let err = ProgramRunner::new()
            .run(&ctx, &job(ProgramConfig::new("sleep", &["30"])))
            .await
            .unwrap_err();
        assert_eq!(err.message, "deadline exceeded");
    }

    #[tokio::test]
    async fn runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ProgramConfig::new("pwd", &[]);
        cfg.workdir = Some(dir.path().to_string_lossy().into_owned());
        let out = ProgramRunner::new().run(&ctx(), &job(cfg)).await.unwrap();
        let expected = dir.path().canonicalize().unwrap();
        let got = std::path::PathBuf::from(out.stdout.trim()).canonicalize().unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let err = ProgramRunner::new()
            .run(&ctx(), &job(ProgramConfig::new("definitely-not-a-real-binary-xyz", &[])))
            .await
            .unwrap_err();
        assert!(err.message.contains("failed to start"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_child() {
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = ProgramRunner::new()
            .run(&ctx, &job(ProgramConfig::new("sleep", &["30"])))
            .await
            .unwrap_err();
        assert_eq!(err.message, "cancelled");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
