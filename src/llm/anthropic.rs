//! Native Anthropic Messages API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use super::{ProviderError, ProviderTurn, ToolCall, ToolCallingProvider, ToolDefinition};
use crate::config::LlmConfig;

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

pub(crate) struct AnthropicProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system: String,
    max_tokens: u32,
    timeout: Duration,
    messages: Vec<Value>,
}

impl AnthropicProvider {
    pub fn new(
        http: reqwest::Client,
        config: &LlmConfig,
        api_key: String,
        model: &str,
        system_prompt: &str,
    ) -> Self {
        Self {
            http,
            base_url: config.anthropic_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            system: system_prompt.to_string(),
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            messages: Vec::new(),
        }
    }
}

#[async_trait]
impl ToolCallingProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn add_user_message(&mut self, text: &str) {
        self.messages.push(json!({ "role": "user", "content": text }));
    }

    async fn call(&mut self, tools: &[ToolDefinition]) -> Result<ProviderTurn, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": self.system,
            "messages": self.messages,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ProviderError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("Failed to read response body: {e}"),
        })?;
        debug!("Anthropic response status: {}", status);
        if !status.is_success() {
            return Err(ProviderError::from_status(PROVIDER, status.as_u16(), &text));
        }

        let (turn, content) = parse_messages_response(&text)?;
        self.messages
            .push(json!({ "role": "assistant", "content": content }));
        Ok(turn)
    }

    fn add_tool_results(&mut self, results: &[(String, String)]) {
        let blocks: Vec<Value> = results
            .iter()
            .map(|(id, output)| {
                json!({ "type": "tool_result", "tool_use_id": id, "content": output })
            })
            .collect();
        self.messages
            .push(json!({ "role": "user", "content": blocks }));
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: MessagesUsage,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Decodes a Messages API body into a turn plus the raw content blocks to
/// echo back as the assistant message.
pub(crate) fn parse_messages_response(body: &str) -> Result<(ProviderTurn, Vec<Value>), ProviderError> {
    let response: MessagesResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("JSON parse error: {e}. Raw: {}", crate::agent::truncate(body, 512)),
        })?;

    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in &response.content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push(t);
                }
            }
            Some("tool_use") => tool_calls.push(ToolCall {
                id: str_field(block, "id"),
                name: str_field(block, "name"),
                arguments: block
                    .get("input")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_else(Map::new),
            }),
            _ => {}
        }
    }

    let stop = response.stop_reason.as_deref();
    let turn = ProviderTurn {
        wants_more_tools: stop == Some("tool_use"),
        tool_calls,
        text: text.join("\n"),
        tokens_in: response.usage.input_tokens,
        tokens_out: response.usage.output_tokens,
        truncated: stop == Some("max_tokens"),
    };
    Ok((turn, response.content))
}

fn str_field(block: &Value, key: &str) -> String {
    block
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
