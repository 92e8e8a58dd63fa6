//! The body POSTed to a worker's `/execute-stream`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::WorkerVariant;
use crate::llm::models::resolve_anthropic_model;
use crate::types::SkillContext;

/// Built-in worker tools the full variant may use.
const FULL_WORKER_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct McpServer {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    pub url: String,
}

/// One agent execution, as the worker receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct WorkerRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_worker_model")]
    pub model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServer>,
    /// Full variant: built-in tools plus `mcp__<server>__<tool>` names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    /// Lightweight variant: raw MCP tool names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_mcp_tools: Vec<String>,
}

fn default_worker_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_max_turns() -> u32 {
    15
}

impl WorkerRequest {
    /// Builds the request for `variant` from a skill context.
    pub fn build(variant: WorkerVariant, ctx: &SkillContext, default_max_turns: u32) -> Self {
        let max_turns = match ctx.sandbox_config.as_ref().map(|c| c.max_iterations) {
            Some(n) if n > 0 => n,
            _ => default_max_turns,
        };

        let mut mcp_servers = BTreeMap::new();
        let mut mcp_tools = Vec::new();
        for binding in ctx.mcp_bindings.iter().filter(|b| b.is_routable()) {
            let transport = match variant {
                WorkerVariant::Full => Some("http".to_string()),
                WorkerVariant::Lightweight => None,
            };
            mcp_servers.insert(
                binding.server.clone(),
                McpServer {
                    transport,
                    url: binding.url.clone(),
                },
            );
            mcp_tools.extend(binding.tools.iter().map(|tool| match variant {
                WorkerVariant::Full => format!("mcp__{}__{tool}", binding.server),
                WorkerVariant::Lightweight => tool.clone(),
            }));
        }

        let (allowed_tools, allowed_mcp_tools, max_budget_usd) = match variant {
            WorkerVariant::Full => {
                let mut tools: Vec<String> =
                    FULL_WORKER_TOOLS.iter().map(|t| (*t).to_string()).collect();
                tools.extend(mcp_tools);
                (tools, Vec::new(), ctx.budget_usd())
            }
            WorkerVariant::Lightweight => (Vec::new(), mcp_tools, None),
        };

        Self {
            prompt: ctx.prompt(),
            system_prompt: ctx.system_prompt.clone(),
            model: resolve_anthropic_model(&ctx.model),
            max_turns,
            max_tokens: None,
            max_budget_usd,
            mcp_servers,
            allowed_tools,
            allowed_mcp_tools,
        }
    }

    /// MCP tool names this request may call, in either variant's spelling
    /// (`tool` or `mcp__<server>__tool`). Empty means no restriction.
    pub fn mcp_allow_list(&self) -> Vec<String> {
        if !self.allowed_mcp_tools.is_empty() {
            return self.allowed_mcp_tools.clone();
        }
        self.allowed_tools
            .iter()
            .filter(|t| t.starts_with("mcp__"))
            .cloned()
            .collect()
    }
}
