//! Tool-calling model providers.
//!
//! Two upstream wire formats are normalized behind [`ToolCallingProvider`]:
//! the OpenAI-compatible chat completions API (via a model router, with
//! per-model fallback chains) and the native Anthropic Messages API. Each
//! provider owns its conversation history in its own message shape.

mod anthropic;
mod error;
#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod models;
mod openai;

pub(crate) use anthropic::AnthropicProvider;
pub(crate) use error::ProviderError;
pub(crate) use openai::OpenRouterProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::config::LlmConfig;

/// A normalized tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// One model response, normalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderTurn {
    /// The model stopped in order to have tools run.
    pub wants_more_tools: bool,
    pub tool_calls: Vec<ToolCall>,
    /// Assistant text, joined across text blocks.
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// The response hit the output token limit.
    pub truncated: bool,
}

/// A tool offered to the model, in the provider-neutral (Anthropic) shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A stateful conversation with a tool-calling model.
#[async_trait]
pub(crate) trait ToolCallingProvider: Send {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Model that served the most recent call (before any call: the
    /// requested model).
    fn model(&self) -> &str;

    fn add_user_message(&mut self, text: &str);

    /// Sends the conversation and appends the assistant reply to it.
    async fn call(&mut self, tools: &[ToolDefinition]) -> Result<ProviderTurn, ProviderError>;

    /// Appends `(call id, output)` pairs in the provider's message shape.
    fn add_tool_results(&mut self, results: &[(String, String)]);
}

/// Builds a provider for one execution.
pub(crate) trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        model: &str,
        system_prompt: &str,
    ) -> Result<Box<dyn ToolCallingProvider>, ProviderError>;
}

/// Picks the router when its key is set, otherwise native Anthropic.
pub(crate) struct HttpProviderFactory {
    config: LlmConfig,
    http: reqwest::Client,
}

impl HttpProviderFactory {
    pub fn new(config: LlmConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(
        &self,
        model: &str,
        system_prompt: &str,
    ) -> Result<Box<dyn ToolCallingProvider>, ProviderError> {
        if let Some(key) = &self.config.openrouter_api_key {
            info!("Using OpenRouter provider for agent execution");
            return Ok(Box::new(OpenRouterProvider::new(
                self.http.clone(),
                &self.config,
                key.clone(),
                model,
                system_prompt,
            )));
        }
        if let Some(key) = &self.config.anthropic_api_key {
            info!("Using Anthropic provider for agent execution");
            return Ok(Box::new(AnthropicProvider::new(
                self.http.clone(),
                &self.config,
                key.clone(),
                &models::resolve_anthropic_model(model),
                system_prompt,
            )));
        }
        Err(ProviderError::NotConfigured)
    }
}

/// Parses tool arguments, tolerating malformed (e.g. truncated) JSON.
pub(crate) fn parse_arguments(raw: &str) -> Map<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}
