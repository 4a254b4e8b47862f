use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::jobs::model::{Job, RunnerConfig};
use crate::jobs::runner::{RunContext, RunResult, Runner, RunnerError};

/// Incremental output from an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Thinking(String),
    Text(String),
}

/// Host-supplied bridge to whatever actually runs the agent.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn exec(
        &self,
        cancel: CancellationToken,
        agent: Option<&str>,
        instructions: &str,
        on_event: &mut (dyn FnMut(AgentEvent) + Send),
    ) -> anyhow::Result<()>;
}

/// Runs `llm` jobs through an [`AgentExecutor`].
#[derive(Clone)]
pub struct LlmRunner {
    executor: Arc<dyn AgentExecutor>,
}

impl LlmRunner {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Runner for LlmRunner {
    async fn run(&self, ctx: &RunContext, job: &Job) -> Result<RunResult, RunnerError> {
        let RunnerConfig::Llm(cfg) = &job.runner else {
            return Err(RunnerError::new("llm runner received a non-llm job"));
        };

        let mut out = RunResult::default();
        let res = {
            let mut on_event = |ev: AgentEvent| match ev {
                AgentEvent::Thinking(delta) => out.thinking.push_str(&delta),
                AgentEvent::Text(delta) => out.response.push_str(&delta),
            };

            tokio::select! {
                r = self.executor.exec(
                    ctx.cancel.clone(),
                    cfg.agent.as_deref(),
                    &cfg.instructions,
                    &mut on_event,
                ) => Some(r),
                _ = ctx.cancel.cancelled() => None,
            }
        };

        match res {
            Some(Ok(())) => Ok(out),
            Some(Err(e)) => Err(RunnerError::with_output(e.to_string(), out)),
            None => Err(RunnerError::with_output("cancelled", out)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{ConcurrencyPolicy, LlmConfig, TriggerConfig};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;
    use uuid::Uuid;

    struct Scripted {
        events: Vec<AgentEvent>,
        fail: Option<&'static str>,
    }

    #[async_trait]
    impl AgentExecutor for Scripted {
        async fn exec(
            &self,
            _cancel: CancellationToken,
            agent: Option<&str>,
            instructions: &str,
            on_event: &mut (dyn FnMut(AgentEvent) + Send),
        ) -> anyhow::Result<()> {
            assert_eq!(agent, Some("reviewer"));
            assert_eq!(instructions, "summarise the logs");
            for ev in &self.events {
                on_event(ev.clone());
            }
            match self.fail {
                Some(msg) => Err(anyhow::anyhow!(msg)),
                None => Ok(()),
            }
        }
    }

    struct Stuck;

    #[async_trait]
    impl AgentExecutor for Stuck {
        async fn exec(
            &self,
            _cancel: CancellationToken,
            _agent: Option<&str>,
            _instructions: &str,
            on_event: &mut (dyn FnMut(AgentEvent) + Send),
        ) -> anyhow::Result<()> {
            on_event(AgentEvent::Text("started".into()));
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            name: "llm".into(),
            enabled: true,
            runner: RunnerConfig::Llm(LlmConfig {
                agent: Some("reviewer".into()),
                instructions: "summarise the logs".into(),
            }),
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
    async fn accumulates_thinking_and_text() {
        let runner = LlmRunner::new(Arc::new(Scripted {
            events: vec![
                AgentEvent::Thinking("let me ".into()),
                AgentEvent::Text("All ".into()),
                AgentEvent::Thinking("look".into()),
                AgentEvent::Text("good.".into()),
            ],
            fail: None,
        }));
        let out = runner.run(&ctx(), &job()).await.unwrap();
        assert_eq!(out.thinking, "let me look");
        assert_eq!(out.response, "All good.");
    }

    #[tokio::test]
    async fn failure_keeps_partial_output() {
        let runner = LlmRunner::new(Arc::new(Scripted {
            events: vec![AgentEvent::Text("half an ans".into())],
            fail: Some("agent crashed"),
        }));
        let err = runner.run(&ctx(), &job()).await.unwrap_err();
        assert_eq!(err.message, "agent crashed");
        assert_eq!(err.output.response, "half an ans");
    }

    #[tokio::test]
    async fn cancellation_returns_promptly() {
        let runner = LlmRunner::new(Arc::new(Stuck));
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = runner.run(&ctx, &job()).await.unwrap_err();
        assert_eq!(err.message, "cancelled");
    }
}
