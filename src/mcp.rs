//! Minimal HTTP MCP client used by the worker-side loop.
//!
//! Servers expose `GET {url}/tools` (tool definitions) and
//! `POST {url}/tools/call` (`{name, arguments}` → `{content, is_error}`).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::{ToolExecutor, TASK_COMPLETE};
use crate::delegate::McpServer;
use crate::llm::ToolDefinition;
use crate::sandbox::ToolOutput;

#[derive(Debug, Deserialize)]
struct CallResponse {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    is_error: bool,
}

/// Tools discovered from a set of MCP servers.
pub(crate) struct McpTools {
    http: reqwest::Client,
    call_timeout: Duration,
    definitions: Vec<ToolDefinition>,
    /// Tool name → server URL.
    routes: BTreeMap<String, String>,
}

impl McpTools {
    /// Fetches every server's tool list, keeping the tools `allowed`
    /// names either raw or as `mcp__<server>__<tool>`. An empty allow list
    /// keeps everything. Unreachable servers are skipped.
    pub async fn discover(
        http: reqwest::Client,
        servers: &BTreeMap<String, McpServer>,
        allowed: &[String],
        fetch_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        let mut definitions = Vec::new();
        let mut routes = BTreeMap::new();

        for (server, config) in servers {
            if config.url.is_empty() {
                continue;
            }
            let url = config.url.trim_end_matches('/').to_string();
            let tools = match fetch_tools(&http, &url, fetch_timeout).await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server = %server, url = %url, error = %e, "Failed to fetch MCP tools");
                    continue;
                }
            };
            for tool in tools {
                let qualified = format!("mcp__{server}__{}", tool.name);
                if !allowed.is_empty() && !allowed.contains(&tool.name) && !allowed.contains(&qualified) {
                    continue;
                }
                routes.insert(tool.name.clone(), url.clone());
                definitions.push(tool);
            }
        }
        info!(tools = ?routes.keys().collect::<Vec<_>>(), "Discovered MCP tools");

        Self {
            http,
            call_timeout,
            definitions,
            routes,
        }
    }

    /// No server contributed a tool.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    async fn call(&self, url: &str, name: &str, args: &Map<String, Value>) -> Result<CallResponse, reqwest::Error> {
        self.http
            .post(format!("{url}/tools/call"))
            .json(&json!({ "name": name, "arguments": args }))
            .timeout(self.call_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

async fn fetch_tools(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<ToolDefinition>, reqwest::Error> {
    http.get(format!("{url}/tools"))
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

#[async_trait]
impl ToolExecutor for McpTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions = self.definitions.clone();
        definitions.push(ToolDefinition {
            name: TASK_COMPLETE.to_string(),
            description: "Signal that the task is finished. Provide a summary and any output URLs."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string", "description": "Summary of what was accomplished"},
                    "url": {"type": "string", "description": "Access URL if applicable"},
                    "port": {"type": "integer", "description": "Port number if applicable"},
                    "deployed": {"type": "boolean", "description": "Whether deployment succeeded"}
                },
                "required": ["summary"]
            }),
        });
        definitions
    }

    async fn execute(&self, name: &str, args: &Map<String, Value>) -> ToolOutput {
        let Some(url) = self.routes.get(name) else {
            return Err(format!("Unknown tool: {name}"));
        };
        let response = self
            .call(url, name, args)
            .await
            .map_err(|e| format!("MCP call failed: {e}"))?;
        let content = match response.content {
            Value::String(text) => text,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if response.is_error {
            Err(content)
        } else {
            Ok(content)
        }
    }
}
