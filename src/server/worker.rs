//! The worker-pod side of delegation: one `/execute-stream` request runs
//! the agent loop and streams SSE frames back.
//!
//! Tools come from the request's MCP servers, plus the built-in workspace
//! tools named in `allowed_tools` for full-variant requests. A request with
//! workspace tools reports every file left in the workspace as `artifacts`.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::workspace::{collect_artifacts, read_task_result, WorkspaceTools};
use crate::agent::{AgentLoop, IterationSink, Termination, ToolExecutor};
use crate::config::{AgentSettings, PricingConfig, WorkerServerConfig};
use crate::delegate::sse::encode;
use crate::delegate::WorkerRequest;
use crate::llm::{ProviderFactory, ToolDefinition};
use crate::mcp::McpTools;
use crate::sandbox::ToolOutput;
use crate::types::AgentIteration;

const NO_TOOLS: &str = "No MCP tools discovered. Check MCP server URLs.";

/// Serves executions for both worker variants.
pub(crate) struct WorkerServer {
    config: WorkerServerConfig,
    agent: AgentSettings,
    pricing: PricingConfig,
    providers: Arc<dyn ProviderFactory>,
    http: reqwest::Client,
}

impl WorkerServer {
    pub fn new(
        config: WorkerServerConfig,
        agent: AgentSettings,
        pricing: PricingConfig,
        providers: Arc<dyn ProviderFactory>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            agent,
            pricing,
            providers,
            http,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
            .route("/execute-stream", post(execute_stream))
            .with_state(self)
    }

    /// Runs one request, sending encoded frames to `frames`. Ends with
    /// exactly one `result` or `error` frame unless the client left.
    async fn run(&self, request: WorkerRequest, frames: FrameSink) {
        let start = Instant::now();
        let mcp = McpTools::discover(
            self.http.clone(),
            &request.mcp_servers,
            &request.mcp_allow_list(),
            Duration::from_secs(self.config.mcp_fetch_timeout_secs),
            Duration::from_secs(self.config.mcp_call_timeout_secs),
        )
        .await;
        let workspace = WorkspaceTools::new(
            self.config.workdir.clone(),
            self.config.command_timeout_secs,
            &request.allowed_tools,
        );
        let tools = WorkerTools {
            workspace: (!workspace.is_empty()).then_some(workspace),
            mcp,
        };
        if tools.is_empty() {
            frames.send("error", &json!({ "error": NO_TOOLS })).await;
            return;
        }
        if let Some(workspace) = &tools.workspace {
            if let Err(e) = workspace.prepare().await {
                frames.send("error", &json!({ "error": e })).await;
                return;
            }
        }

        let mut provider = match self.providers.create(&request.model, &request.system_prompt) {
            Ok(provider) => provider,
            Err(e) => {
                frames.send("error", &json!({ "error": e.to_string() })).await;
                return;
            }
        };

        let outcome = AgentLoop::new(request.max_turns, &self.agent, &self.pricing)
            .run(provider.as_mut(), &tools, &request.prompt, &frames)
            .await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &outcome.termination {
            Termination::Cancelled => info!("client disconnected, execution abandoned"),
            Termination::ProviderFailed(error) => {
                warn!(error = %error, "worker agent loop failed");
                frames
                    .send("error", &json!({ "error": error, "latency_ms": latency_ms }))
                    .await;
            }
            Termination::Completed | Termination::MaxIterations => {
                let mut task_result = outcome.output.clone();
                if outcome.termination == Termination::MaxIterations {
                    task_result.insert("max_iterations_reached".to_string(), Value::Bool(true));
                }
                let mut artifacts = None;
                if let Some(workspace) = &tools.workspace {
                    if let Some(written) = read_task_result(workspace.root()).await {
                        task_result.extend(written);
                    }
                    artifacts = Some(collect_artifacts(workspace.root()).await);
                }
                let summary = task_result.get("summary").cloned().unwrap_or_else(|| json!(""));
                let mut result = json!({
                    "success": outcome.succeeded(),
                    "cost_usd": outcome.cost_usd,
                    "latency_ms": latency_ms,
                    "iterations_count": outcome.iterations.len(),
                    "task_result": task_result,
                    "summary": summary,
                });
                if let Some(artifacts) = artifacts {
                    info!(count = artifacts.len(), "collected workspace artifacts");
                    result["artifacts"] = Value::Object(artifacts);
                }
                frames.send("result", &result).await;
            }
        }
    }
}

/// Workspace tools when the request enabled any, then MCP tools and
/// `task_complete`.
struct WorkerTools {
    workspace: Option<WorkspaceTools>,
    mcp: McpTools,
}

impl WorkerTools {
    fn is_empty(&self) -> bool {
        self.workspace.is_none() && self.mcp.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for WorkerTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions = self
            .workspace
            .as_ref()
            .map(WorkspaceTools::definitions)
            .unwrap_or_default();
        definitions.extend(self.mcp.definitions());
        definitions
    }

    async fn execute(&self, name: &str, args: &Map<String, Value>) -> ToolOutput {
        match &self.workspace {
            Some(workspace) if workspace.offers(name) => workspace.execute(name, args).await,
            _ => self.mcp.execute(name, args).await,
        }
    }
}

/// Encodes loop iterations as `iteration` + `tool_result` frame pairs.
struct FrameSink {
    tx: mpsc::Sender<String>,
}

impl FrameSink {
    async fn send(&self, event: &str, data: &Value) -> bool {
        self.tx.send(encode(event, data)).await.is_ok()
    }
}

#[async_trait]
impl IterationSink for FrameSink {
    async fn emit(&self, call_id: &str, iteration: AgentIteration) -> bool {
        let header = json!({
            "iteration": iteration.iteration,
            "tool_name": iteration.tool_name,
            "tool_input": iteration.tool_input,
            "timestamp": iteration.timestamp,
        });
        self.send("iteration", &header).await
            && self
                .send(
                    "tool_result",
                    &json!({ "tool_use_id": call_id, "output": iteration.tool_output }),
                )
                .await
    }
}

async fn execute_stream(
    State(server): State<Arc<WorkerServer>>,
    Json(request): Json<WorkerRequest>,
) -> Response {
    info!(
        model = %request.model,
        max_turns = request.max_turns,
        servers = request.mcp_servers.len(),
        allowed_tools = request.allowed_tools.len(),
        "execute-stream request"
    );
    let (tx, rx) = mpsc::channel(server.agent.event_buffer.max(1));
    tokio::spawn(async move { server.run(request, FrameSink { tx }).await });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
