//! Execution contract types: `SkillContext` in, `SkillResult` out.
//!
//! Everything here is plain serde data so the same shapes travel over
//! the CLI (`run <context.json>`), the worker stream, and the logs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Immutable run parameters for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Cloud sandbox template name.
    #[serde(default = "default_template")]
    pub template: String,

    /// Cloud sandbox lifetime in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Model turn budget for the agent loop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// CPU cores for the container or pod.
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    /// Memory in MiB for the container or pod.
    #[serde(default = "default_memory")]
    pub memory: u32,

    /// Executor selector: `claude-code` or `ptc` route to a worker pod,
    /// anything else runs the local loop.
    #[serde(default)]
    pub executor: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            timeout: default_timeout(),
            max_iterations: default_max_iterations(),
            cpu: default_cpu(),
            memory: default_memory(),
            executor: None,
        }
    }
}

fn default_template() -> String {
    "base".to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_max_iterations() -> u32 {
    20
}

fn default_cpu() -> u32 {
    1
}

fn default_memory() -> u32 {
    512
}

/// An MCP server a skill may call, with the tools it is allowed to use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpBinding {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl McpBinding {
    /// A binding is usable only when both the server name and URL are set.
    pub fn is_routable(&self) -> bool {
        !self.server.is_empty() && !self.url.is_empty()
    }
}

/// Input to one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillContext {
    pub skill_name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub input_data: Map<String, Value>,
    #[serde(default)]
    pub sandbox_config: Option<SandboxConfig>,
    #[serde(default)]
    pub mcp_bindings: Vec<McpBinding>,
    #[serde(default = "default_cost_budget")]
    pub cost_budget: String,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4.5".to_string()
}

fn default_cost_budget() -> String {
    "$1.00".to_string()
}

impl SkillContext {
    /// Sandbox settings for this run, falling back to defaults.
    pub fn sandbox(&self) -> SandboxConfig {
        self.sandbox_config.clone().unwrap_or_default()
    }

    /// The first user message: the input data, pretty-printed.
    pub fn prompt(&self) -> String {
        serde_json::to_string_pretty(&self.input_data).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parses `"$1.00"` style budgets into dollars.
    pub fn budget_usd(&self) -> Option<f64> {
        parse_cost_budget(&self.cost_budget)
    }
}

/// Parses `"$1.00"` into `1.0`; `None` when the string is not a number.
pub(crate) fn parse_cost_budget(budget: &str) -> Option<f64> {
    budget.trim().trim_start_matches('$').trim().parse().ok()
}

/// One tool call and its (truncated) response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIteration {
    pub iteration: u32,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Map<String, Value>,
    #[serde(default)]
    pub tool_output: String,
    pub timestamp: String,
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillResult {
    pub skill_name: String,
    pub success: bool,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub reasoning_trace: Vec<String>,
    #[serde(default)]
    pub model_used: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default)]
    pub context_for_next: Map<String, Value>,
}

impl SkillResult {
    /// A failed result carrying only an error message.
    pub fn failure(skill_name: &str, model: &str, error: impl Into<String>) -> Self {
        let mut output = Map::new();
        output.insert("error".to_string(), Value::String(error.into()));
        Self {
            skill_name: skill_name.to_string(),
            success: false,
            output,
            model_used: model.to_string(),
            ..Self::default()
        }
    }

    /// The error message, if this result carries one.
    pub fn error(&self) -> Option<&str> {
        self.output.get("error").and_then(Value::as_str)
    }
}
