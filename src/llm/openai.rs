//! OpenAI-compatible chat completions through a model router.
//!
//! Tool calls are echoed back in the assistant message with JSON-string
//! arguments, and results go back as `role: "tool"` messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::models::{fallback_chain, resolve_router_model};
use super::{parse_arguments, ProviderError, ProviderTurn, ToolCall, ToolCallingProvider, ToolDefinition};
use crate::config::LlmConfig;

const PROVIDER: &str = "openrouter";

pub(crate) struct OpenRouterProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    referer: String,
    title: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    chain: Vec<String>,
    served_by: String,
    messages: Vec<ChatCompletionMessage>,
}

impl OpenRouterProvider {
    pub fn new(
        http: reqwest::Client,
        config: &LlmConfig,
        api_key: String,
        model: &str,
        system_prompt: &str,
    ) -> Self {
        let resolved = resolve_router_model(model, &config.aliases);
        Self {
            http,
            base_url: config.openrouter_base_url.trim_end_matches('/').to_string(),
            api_key,
            referer: config.referer.clone(),
            title: config.title.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_secs),
            chain: fallback_chain(&resolved),
            served_by: resolved,
            messages: vec![ChatCompletionMessage::text("system", system_prompt)],
        }
    }

    async fn send_request(
        &self,
        model: &str,
        tools: &[ToolDefinition],
    ) -> Result<(ProviderTurn, ChatCompletionMessage), ProviderError> {
        let body = ChatCompletionRequest {
            model,
            messages: &self.messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: (!tools.is_empty()).then(|| tools.iter().map(ChatCompletionTool::from).collect()),
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
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
        debug!("OpenRouter response status: {}", status);

        if !status.is_success() {
            return Err(ProviderError::from_status(PROVIDER, status.as_u16(), &text));
        }
        parse_chat_completion(&text)
    }
}

#[async_trait]
impl ToolCallingProvider for OpenRouterProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.served_by
    }

    fn add_user_message(&mut self, text: &str) {
        self.messages.push(ChatCompletionMessage::text("user", text));
    }

    async fn call(&mut self, tools: &[ToolDefinition]) -> Result<ProviderTurn, ProviderError> {
        let mut last_error = None;
        for model in &self.chain {
            match self.send_request(model, tools).await {
                Ok((turn, assistant)) => {
                    self.messages.push(assistant);
                    self.served_by.clone_from(model);
                    return Ok(turn);
                }
                Err(e) if e.is_retryable() => {
                    warn!(model = %model, error = %e, "model failed, trying next in chain");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProviderError::Exhausted {
            last: last_error.map_or_else(|| "empty model chain".to_string(), |e| e.to_string()),
        })
    }

    fn add_tool_results(&mut self, results: &[(String, String)]) {
        for (call_id, output) in results {
            self.messages.push(ChatCompletionMessage {
                role: "tool".to_string(),
                content: Some(output.clone()),
                tool_call_id: Some(call_id.clone()),
                tool_calls: None,
            });
        }
    }
}

/// Decodes a chat completion body into a turn plus the assistant message
/// to append to the history.
pub(crate) fn parse_chat_completion(
    body: &str,
) -> Result<(ProviderTurn, ChatCompletionMessage), ProviderError> {
    let response: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("JSON parse error: {e}. Raw: {}", crate::agent::truncate(body, 512)),
        })?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "response has no choices".to_string(),
        })?;

    let raw_calls = choice.message.tool_calls.unwrap_or_default();
    let tool_calls: Vec<ToolCall> = raw_calls
        .iter()
        .map(|call| ToolCall {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments: parse_arguments(&call.function.arguments),
        })
        .collect();
    let text = choice.message.content.unwrap_or_default();
    let usage = response.usage.unwrap_or_default();

    let assistant = ChatCompletionMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then(|| text.clone()),
        tool_call_id: None,
        tool_calls: (!raw_calls.is_empty()).then_some(raw_calls),
    };
    let turn = ProviderTurn {
        wants_more_tools: !tool_calls.is_empty(),
        tool_calls,
        text,
        tokens_in: usage.prompt_tokens,
        tokens_out: usage.completion_tokens,
        truncated: choice.finish_reason.as_deref() == Some("length"),
    };
    Ok((turn, assistant))
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatCompletionMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatCompletionTool<'a>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatCompletionMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

impl ChatCompletionMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatCompletionFunction<'a>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

impl<'a> From<&'a ToolDefinition> for ChatCompletionTool<'a> {
    fn from(tool: &'a ToolDefinition) -> Self {
        Self {
            tool_type: "function",
            function: ChatCompletionFunction {
                name: &tool.name,
                description: &tool.description,
                parameters: &tool.input_schema,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatCompletionToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ChatCompletionToolCallFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatCompletionToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    const TOOL_CALL_BODY: &str = r#"{
        "id": "gen-1",
        "model": "anthropic/claude-sonnet-4-5-20250929",
        "choices": [{
            "index": 0,
            "finish_reason": "tool_calls",
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "write_file", "arguments": "{\"path\":\"/home/sandbox/a.py\",\"content\":\"print(1)\"}"}
                }]
            }
        }],
        "usage": {"prompt_tokens": 120, "completion_tokens": 30}
    }"#;

    #[test]
    fn test_parse_tool_calls() {
        let (turn, assistant) = parse_chat_completion(TOOL_CALL_BODY).unwrap();
        assert!(turn.wants_more_tools);
        assert!(!turn.truncated);
        assert_eq!(turn.tokens_in, 120);
        assert_eq!(turn.tokens_out, 30);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name, "write_file");
        assert_eq!(turn.tool_calls[0].arguments["path"], "/home/sandbox/a.py");

        let echoed = serde_json::to_value(&assistant).unwrap();
        assert_eq!(echoed["role"], "assistant");
        assert!(echoed.get("content").is_none());
        assert_eq!(echoed["tool_calls"][0]["function"]["name"], "write_file");
        assert!(echoed["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn test_parse_text_and_length() {
        let body = r#"{"choices":[{"finish_reason":"length","message":{"role":"assistant","content":"partial"}}]}"#;
        let (turn, _) = parse_chat_completion(body).unwrap();
        assert!(!turn.wants_more_tools);
        assert!(turn.truncated);
        assert_eq!(turn.text, "partial");
        assert_eq!(turn.tokens_in, 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_chat_completion("<html>").unwrap_err();
        assert!(err.is_retryable());
        let err = parse_chat_completion(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[derive(Clone, Default)]
    struct Seen(Arc<Mutex<Vec<Value>>>);

    fn provider(base: String, model: &str) -> OpenRouterProvider {
        let config = LlmConfig {
            openrouter_base_url: base,
            ..LlmConfig::default()
        };
        OpenRouterProvider::new(reqwest::Client::new(), &config, "sk-or".to_string(), model, "be brief")
    }

    #[tokio::test]
    async fn test_falls_back_on_server_error() {
        let seen = Seen::default();
        let router = Router::new()
            .route(
                "/chat/completions",
                post(|State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(headers["authorization"], "Bearer sk-or");
                    assert_eq!(headers["x-title"], "Agentura");
                    let model = body["model"].as_str().unwrap_or_default().to_string();
                    seen.0.lock().unwrap().push(body);
                    if model == "anthropic/claude-sonnet-4-5-20250929" {
                        (StatusCode::BAD_GATEWAY, "upstream down".to_string())
                    } else {
                        (StatusCode::OK, TOOL_CALL_BODY.to_string())
                    }
                }),
            )
            .with_state(seen.clone());
        let base = serve(router).await;

        let mut provider = provider(base, "claude-sonnet-4.5");
        provider.add_user_message("{}");
        let tools = vec![ToolDefinition {
            name: "write_file".to_string(),
            description: "Write a file".to_string(),
            input_schema: json!({"type": "object"}),
        }];
        let turn = provider.call(&tools).await.unwrap();
        assert_eq!(turn.tool_calls[0].id, "call_1");
        assert_eq!(provider.model(), "anthropic/claude-haiku-4-5-20251001");

        provider.add_tool_results(&[("call_1".to_string(), "Written 8 bytes".to_string())]);
        assert_eq!(provider.messages.len(), 4);
        assert_eq!(provider.messages[3].role, "tool");

        let bodies = seen.0.lock().unwrap();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["tools"][0]["type"], "function");
        assert_eq!(bodies[0]["tools"][0]["function"]["name"], "write_file");
        assert_eq!(bodies[0]["messages"][0]["role"], "system");
        assert_eq!(bodies[0]["max_tokens"], 4096);
    }

    #[tokio::test]
    async fn test_exhausted_chain() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base = serve(router).await;
        let mut provider = provider(base, "gpt-4o");
        provider.add_user_message("hi");
        let err = provider.call(&[]).await.unwrap_err();
        assert_eq!(err.to_string(), "All models failed. Last error: openrouter rate limited");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let calls = Seen::default();
        let router = Router::new()
            .route(
                "/chat/completions",
                post(|State(calls): State<Seen>| async move {
                    calls.0.lock().unwrap().push(Value::Null);
                    (StatusCode::UNAUTHORIZED, "bad key")
                }),
            )
            .with_state(calls.clone());
        let base = serve(router).await;
        let mut provider = provider(base, "claude-opus-4");
        let err = provider.call(&[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 401, .. }));
        assert_eq!(calls.0.lock().unwrap().len(), 1);
    }
}
