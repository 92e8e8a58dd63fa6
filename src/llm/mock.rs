//! Scripted tool-calling provider for testing.
//!
//! Replays predetermined turns and records the conversation it was fed
//! so tests can assert on corrective messages and tool results.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{ProviderError, ProviderFactory, ProviderTurn, ToolCall, ToolCallingProvider, ToolDefinition};

/// A single scripted response.
#[derive(Debug, Clone)]
pub(crate) enum MockTurn {
    Reply(ProviderTurn),
    /// Fail as if every model in the chain failed.
    Exhausted(String),
    /// Never answer.
    Stall,
}

impl MockTurn {
    /// A turn requesting the given `(name, arguments)` tool calls.
    pub fn tools(calls: &[(&str, Value)]) -> Self {
        let tool_calls = calls
            .iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall {
                id: format!("call_{i}"),
                name: (*name).to_string(),
                arguments: args.as_object().cloned().unwrap_or_default(),
            })
            .collect();
        Self::Reply(ProviderTurn {
            wants_more_tools: true,
            tool_calls,
            tokens_in: 1000,
            tokens_out: 100,
            ..ProviderTurn::default()
        })
    }

    /// A final text-only turn.
    pub fn text(text: &str) -> Self {
        Self::Reply(ProviderTurn {
            text: text.to_string(),
            tokens_in: 1000,
            tokens_out: 100,
            ..ProviderTurn::default()
        })
    }

    /// A turn cut off by the output token limit.
    pub fn truncated(calls: &[(&str, Value)]) -> Self {
        match Self::tools(calls) {
            Self::Reply(mut turn) => {
                turn.truncated = true;
                turn.wants_more_tools = false;
                Self::Reply(turn)
            }
            other => other,
        }
    }
}

/// Replays turns in order; the final turn repeats once the script runs out.
#[derive(Debug, Clone)]
pub(crate) struct MockProvider {
    script: Arc<Vec<MockTurn>>,
    calls: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
    offered: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    pub fn new(script: Vec<MockTurn>) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
            offered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages fed to the provider, as `user: ...` / `tool <id>: ...`.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Tool names offered on the most recent call.
    pub fn offered(&self) -> Vec<String> {
        self.offered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolCallingProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn add_user_message(&mut self, text: &str) {
        self.log.lock().unwrap().push(format!("user: {text}"));
    }

    async fn call(&mut self, tools: &[ToolDefinition]) -> Result<ProviderTurn, ProviderError> {
        *self.offered.lock().unwrap() = tools.iter().map(|t| t.name.clone()).collect();
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(turn) = self.script.get(n).or_else(|| self.script.last()) else {
            return Ok(ProviderTurn::default());
        };
        match turn {
            MockTurn::Reply(turn) => Ok(turn.clone()),
            MockTurn::Exhausted(last) => Err(ProviderError::Exhausted { last: last.clone() }),
            MockTurn::Stall => std::future::pending().await,
        }
    }

    fn add_tool_results(&mut self, results: &[(String, String)]) {
        let mut log = self.log.lock().unwrap();
        for (id, output) in results {
            log.push(format!("tool {id}: {output}"));
        }
    }
}

/// Hands out clones of one [`MockProvider`], or fails as unconfigured.
#[derive(Debug, Clone)]
pub(crate) struct MockProviderFactory {
    provider: Option<MockProvider>,
}

impl MockProviderFactory {
    pub fn new(provider: MockProvider) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    pub fn unconfigured() -> Self {
        Self { provider: None }
    }
}

impl ProviderFactory for MockProviderFactory {
    fn create(
        &self,
        _model: &str,
        _system_prompt: &str,
    ) -> Result<Box<dyn ToolCallingProvider>, ProviderError> {
        match &self.provider {
            Some(provider) => Ok(Box::new(provider.clone())),
            None => Err(ProviderError::NotConfigured),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_script_replays_and_last_turn_repeats() {
        let mut provider = MockProvider::new(vec![
            MockTurn::tools(&[("run_command", json!({"command": "ls"}))]),
            MockTurn::text("done"),
        ]);
        let first = provider.call(&[]).await.unwrap();
        assert_eq!(first.tool_calls[0].name, "run_command");
        assert_eq!(provider.call(&[]).await.unwrap().text, "done");
        assert_eq!(provider.call(&[]).await.unwrap().text, "done");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_records_conversation() {
        let mut provider = MockProvider::new(vec![MockTurn::Exhausted("boom".to_string())]);
        provider.add_user_message("hello");
        provider.add_tool_results(&[("call_0".to_string(), "ok".to_string())]);
        assert_eq!(provider.log(), vec!["user: hello", "tool call_0: ok"]);
        assert!(provider.call(&[]).await.is_err());
    }
}
