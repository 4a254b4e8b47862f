pub mod llm;
pub mod program;

pub use llm::{AgentEvent, AgentExecutor, LlmRunner};
pub use program::ProgramRunner;
