//! The multi-turn tool-calling loop.
//!
//! [`AgentLoop`] alternates model turns with tool dispatch until the model
//! stops asking for tools, calls `task_complete`, or runs out of turns.
//! Tools are reached through a [`ToolExecutor`]: sandbox primitives for
//! local executions, MCP servers inside a worker pod.

mod artifacts;
mod runner;
mod tools;

pub(crate) use artifacts::{extract_artifacts, files_created};
pub(crate) use runner::{AgentLoop, IterationSink, LoopOutcome, Termination};
pub(crate) use tools::{optional, required, tool, SandboxTools, ToolExecutor, TASK_COMPLETE};

use tokio::sync::mpsc;

use crate::types::{AgentIteration, SkillResult};

/// One item on an execution's event stream: zero or more iterations,
/// then exactly one result.
#[derive(Debug, Clone)]
pub(crate) enum AgentEvent {
    Iteration(AgentIteration),
    Result(SkillResult),
}

#[async_trait::async_trait]
impl IterationSink for mpsc::Sender<AgentEvent> {
    async fn emit(&self, _call_id: &str, iteration: AgentIteration) -> bool {
        self.send(AgentEvent::Iteration(iteration)).await.is_ok()
    }
}

/// The first `max_chars` characters of `text`, on a char boundary.
pub(crate) fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
