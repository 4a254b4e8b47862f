use async_trait::async_trait;
use cronflow::config::Config;
use cronflow::jobs::runners::{AgentEvent, AgentExecutor, LlmRunner, ProgramRunner};
use cronflow::jobs::{RunnerRegistry, RunnerType};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runners available to this daemon. `llm` jobs need `CRONFLOW_AGENT_COMMAND`.
pub fn build_registry(cfg: &Config) -> RunnerRegistry {
    let mut registry = RunnerRegistry::new();
    registry.register(RunnerType::Program, ProgramRunner::new());

    match cfg.agent_command.clone() {
        Some(command) => {
            tracing::info!(%command, "llm runner enabled");
            let agent = CommandAgent::new(command);
            registry.register(RunnerType::Llm, LlmRunner::new(Arc::new(agent)));
        }
        None => tracing::info!("llm runner disabled, CRONFLOW_AGENT_COMMAND is not set"),
    }

    registry
}

/// Runs an external agent command through `sh -c`.
///
/// Instructions go to stdin and the agent name to `CRONFLOW_AGENT`. Each
/// stdout line is a response delta, each stderr line a thinking delta.
pub struct CommandAgent {
    command: String,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl AgentExecutor for CommandAgent {
    async fn exec(
        &self,
        cancel: CancellationToken,
        agent: Option<&str>,
        instructions: &str,
        on_event: &mut (dyn FnMut(AgentEvent) + Send),
    ) -> anyhow::Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CRONFLOW_AGENT", agent.unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = instructions.to_owned();
            tokio::spawn(async move {
                // agents that ignore stdin close it early
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent stderr unavailable"))?;
        let mut out = BufReader::new(stdout).lines();
        let mut err = BufReader::new(stderr).lines();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    anyhow::bail!("cancelled");
                }
                line = out.next_line(), if !out_done => match line? {
                    Some(l) => on_event(AgentEvent::Text(format!("{l}\n"))),
                    None => out_done = true,
                },
                line = err.next_line(), if !err_done => match line? {
                    Some(l) => on_event(AgentEvent::Thinking(format!("{l}\n"))),
                    None => err_done = true,
                },
            }
        }

        // dropping the child on cancel kills it
        let status = tokio::select! {
            s = child.wait() => s?,
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
        };
        if !status.success() {
            anyhow::bail!("agent command exited with {status}");
        }
        Ok(())
    }
}
