//! Runs an execution inside a worker pod instead of locally.
//!
//! The worker pod embeds the same agent loop. This side provisions the
//! pod, POSTs one request to `/execute-stream`, bridges the SSE frames
//! back into local [`AgentIteration`]s and a [`SkillResult`], and deletes
//! the pod.

mod request;
pub(crate) mod sse;
mod vocabulary;

pub(crate) use request::{McpServer, WorkerRequest};

use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::agent::IterationSink;
use crate::config::{KubernetesConfig, WorkerConfig, WorkersConfig};
use crate::sandbox::kubernetes::{launch_pod, PodSpec};
use crate::sandbox::{sandbox_name, ClusterApi};
use crate::types::{AgentIteration, SkillContext, SkillResult};
use sse::SseDecoder;
use vocabulary::map_worker_tool;

/// Which worker image an execution is delegated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerVariant {
    /// File, shell, and MCP tools.
    Full,
    /// MCP dispatch only.
    Lightweight,
}

impl WorkerVariant {
    /// Maps a skill's `executor` setting to a variant.
    pub fn from_executor(executor: &str) -> Option<Self> {
        match executor {
            "claude-code" => Some(Self::Full),
            "ptc" => Some(Self::Lightweight),
            _ => None,
        }
    }

    pub fn config(self, workers: &WorkersConfig) -> &WorkerConfig {
        match self {
            Self::Full => &workers.full,
            Self::Lightweight => &workers.lightweight,
        }
    }

    fn app(self) -> &'static str {
        match self {
            Self::Full => "claude-code-worker",
            Self::Lightweight => "ptc-worker",
        }
    }

    fn name_prefix(self) -> &'static str {
        match self {
            Self::Full => "cc-worker",
            Self::Lightweight => "ptc-worker",
        }
    }

    fn probe_delay_secs(self) -> u32 {
        match self {
            Self::Full => 3,
            Self::Lightweight => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Full => "Claude Code Worker",
            Self::Lightweight => "PTC Worker",
        }
    }
}

impl std::fmt::Display for WorkerVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Lightweight => write!(f, "lightweight"),
        }
    }
}

/// Failures talking to a provisioned worker. Provisioning itself fails
/// with a [`crate::sandbox::SandboxError`].
#[derive(Debug, thiserror::Error)]
pub(crate) enum DelegateError {
    #[error("worker request failed: {0}")]
    Request(String),

    #[error("worker returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("worker timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("event consumer went away")]
    Cancelled,
}

/// Delegates whole executions to worker pods of one variant.
pub(crate) struct RemoteAgentDelegate {
    variant: WorkerVariant,
    worker: WorkerConfig,
    kubernetes: KubernetesConfig,
    cluster: Arc<dyn ClusterApi>,
    http: reqwest::Client,
    env: BTreeMap<String, String>,
    port: u16,
}

impl RemoteAgentDelegate {
    pub fn new(
        variant: WorkerVariant,
        workers: &WorkersConfig,
        kubernetes: KubernetesConfig,
        cluster: Arc<dyn ClusterApi>,
        http: reqwest::Client,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            variant,
            worker: variant.config(workers).clone(),
            kubernetes,
            cluster,
            http,
            env,
            port: workers.port,
        }
    }

    fn pod_spec(&self) -> PodSpec {
        PodSpec {
            name: sandbox_name(self.variant.name_prefix()),
            namespace: self.kubernetes.namespace.clone(),
            app: self.variant.app(),
            container: "worker",
            image: self.worker.image.clone(),
            image_pull_policy: self.kubernetes.image_pull_policy.clone(),
            cpu: self.worker.cpu.clone(),
            memory: self.worker.memory.clone(),
            env: self.env.clone(),
            probe_initial_delay_secs: self.variant.probe_delay_secs(),
            runtime_class: None,
            ipc_volume: false,
        }
    }

    /// Runs `ctx` on a fresh worker pod, forwarding iterations to `sink`.
    /// The pod is deleted on every path once it exists, including when this
    /// future is dropped mid-stream.
    pub async fn execute(&self, ctx: &SkillContext, sink: &dyn IterationSink) -> SkillResult {
        let start = Instant::now();
        let spec = self.pod_spec();
        let (pod, ip) = match launch_pod(
            &self.cluster,
            &spec,
            Duration::from_secs(self.kubernetes.pod_ready_timeout_secs),
            Duration::from_millis(self.kubernetes.poll_interval_ms),
        )
        .await
        {
            Ok(launched) => launched,
            Err(e) => {
                warn!(variant = %self.variant, error = %e, "worker provisioning failed");
                return finish(SkillResult::failure(&ctx.skill_name, &ctx.model, e.to_string()), start);
            }
        };
        info!(event = "worker_ready", variant = %self.variant, pod = %spec.name, ip = %ip);

        let request = WorkerRequest::build(self.variant, ctx, self.worker.default_max_turns);
        let url = format!("http://{ip}:{}/execute-stream", self.port);
        let mut bridge = StreamBridge::default();
        let outcome = tokio::time::timeout(
            Duration::from_secs(self.worker.timeout_secs),
            self.stream(&url, &request, &mut bridge, sink),
        )
        .await
        .unwrap_or(Err(DelegateError::Timeout {
            secs: self.worker.timeout_secs,
        }));

        pod.delete().await;

        let result = match outcome {
            Ok(()) => bridge.into_result(ctx, self.variant, &spec.name, sink).await,
            Err(e) => {
                warn!(variant = %self.variant, pod = %spec.name, error = %e, "worker execution failed");
                bridge.flush(sink).await;
                let mut result = SkillResult::failure(&ctx.skill_name, &ctx.model, e.to_string());
                result.output.insert(
                    "iterations_count".to_string(),
                    bridge.iterations.len().into(),
                );
                result
            }
        };
        finish(result, start)
    }

    async fn stream(
        &self,
        url: &str,
        request: &WorkerRequest,
        bridge: &mut StreamBridge,
        sink: &dyn IterationSink,
    ) -> Result<(), DelegateError> {
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| DelegateError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DelegateError::Status {
                status: status.as_u16(),
                body: crate::agent::truncate(&body, 300).to_string(),
            });
        }

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| DelegateError::Request(e.to_string()))?;
            for frame in decoder.push(&chunk) {
                if !bridge.apply(&frame.event, frame.data, sink).await {
                    return Err(DelegateError::Cancelled);
                }
            }
        }
        if decoder.pending() > 0 {
            debug!(bytes = decoder.pending(), "worker stream ended mid-frame");
        }
        Ok(())
    }
}

fn finish(mut result: SkillResult, start: Instant) -> SkillResult {
    result.latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    result
}

/// Folds worker frames into local iterations and the terminal result.
///
/// An iteration is held back until its `tool_result` (or the next frame)
/// arrives so consumers see it with its output filled in.
#[derive(Debug, Default)]
struct StreamBridge {
    iterations: Vec<AgentIteration>,
    pending: Option<AgentIteration>,
    result: Option<Map<String, Value>>,
    error: Option<String>,
}

impl StreamBridge {
    /// Applies one frame. Returns `false` when the sink has closed.
    async fn apply(&mut self, event: &str, data: Value, sink: &dyn IterationSink) -> bool {
        match event {
            "iteration" => {
                if !self.flush(sink).await {
                    return false;
                }
                let number = self.iterations.len() + usize::from(self.pending.is_some()) + 1;
                let input = data["tool_input"].as_object().cloned().unwrap_or_default();
                let (tool_name, tool_input) =
                    map_worker_tool(data["tool_name"].as_str().unwrap_or_default(), &input);
                self.pending = Some(AgentIteration {
                    iteration: data["iteration"]
                        .as_u64()
                        .and_then(|n| u32::try_from(n).ok())
                        .unwrap_or_else(|| u32::try_from(number).unwrap_or(u32::MAX)),
                    tool_name,
                    tool_input,
                    tool_output: String::new(),
                    timestamp: data["timestamp"]
                        .as_str()
                        .map_or_else(|| chrono::Utc::now().to_rfc3339(), str::to_string),
                });
                true
            }
            "tool_result" => {
                let output = crate::agent::truncate(data["output"].as_str().unwrap_or_default(), 2000)
                    .to_string();
                if let Some(pending) = self.pending.as_mut() {
                    pending.tool_output = output;
                    return self.flush(sink).await;
                }
                if let Some(last) = self.iterations.last_mut() {
                    last.tool_output = output;
                }
                true
            }
            "result" => {
                self.result = Some(data.as_object().cloned().unwrap_or_default());
                self.flush(sink).await
            }
            "error" => {
                self.error = Some(
                    data["error"]
                        .as_str()
                        .unwrap_or("unknown")
                        .to_string(),
                );
                self.flush(sink).await
            }
            _ => true,
        }
    }

    /// Emits the held-back iteration, if any.
    async fn flush(&mut self, sink: &dyn IterationSink) -> bool {
        let Some(iteration) = self.pending.take() else {
            return true;
        };
        self.iterations.push(iteration.clone());
        sink.emit("", iteration).await
    }

    async fn into_result(
        mut self,
        ctx: &SkillContext,
        variant: WorkerVariant,
        pod: &str,
        sink: &dyn IterationSink,
    ) -> SkillResult {
        self.flush(sink).await;
        let count = self.iterations.len();
        let reasoning_trace = vec![
            format!("{}: {count} tool calls", variant.label()),
            format!("Worker pod: {pod}"),
        ];

        let (success, mut output, cost_usd, context_for_next) = match (self.error, self.result) {
            (Some(error), _) => {
                let mut output = Map::new();
                output.insert("error".to_string(), Value::String(error));
                (false, output, 0.0, Map::new())
            }
            (None, Some(data)) => {
                let mut output = match data.get("task_result") {
                    Some(Value::Object(task)) if !task.is_empty() => task.clone(),
                    _ => {
                        let mut output = Map::new();
                        output.insert(
                            "summary".to_string(),
                            data.get("summary").cloned().unwrap_or_else(|| Value::String(String::new())),
                        );
                        output
                    }
                };
                let mut context = Map::new();
                if let Some(Value::Object(artifacts)) = data.get("artifacts") {
                    if !artifacts.is_empty() {
                        context.insert("artifacts".to_string(), Value::Object(artifacts.clone()));
                    }
                }
                output.remove("iterations_count");
                (
                    data.get("success").and_then(Value::as_bool).unwrap_or(false),
                    output,
                    data.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0),
                    context,
                )
            }
            (None, None) => {
                let mut output = Map::new();
                output.insert(
                    "error".to_string(),
                    Value::String("worker stream ended without a result".to_string()),
                );
                (false, output, 0.0, Map::new())
            }
        };
        output.insert("iterations_count".to_string(), count.into());

        SkillResult {
            skill_name: ctx.skill_name.clone(),
            success,
            output,
            reasoning_trace,
            model_used: ctx.model.clone(),
            cost_usd,
            latency_ms: 0.0,
            context_for_next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sse::encode;
    use super::*;
    use crate::sandbox::kubernetes::fake::FakeCluster;
    use crate::testutil::serve;
    use async_trait::async_trait;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<AgentIteration>>);

    #[async_trait]
    impl IterationSink for Collect {
        async fn emit(&self, _call_id: &str, iteration: AgentIteration) -> bool {
            self.0.lock().unwrap().push(iteration);
            true
        }
    }

    fn context(executor: &str) -> SkillContext {
        serde_json::from_value(json!({
            "skill_name": "deployer",
            "model": "anthropic/claude-sonnet-4.5",
            "input_data": {"service": "web"},
            "sandbox_config": {"executor": executor},
            "mcp_bindings": [{"server": "k8s", "url": "http://mcp:8080", "tools": ["kubectl_apply"]}]
        }))
        .unwrap()
    }

    /// Stands a worker up on localhost and points a delegate at it through
    /// a fake cluster reporting 127.0.0.1 as the pod IP.
    async fn delegate(
        variant: WorkerVariant,
        body: String,
        timeout_secs: u64,
    ) -> (RemoteAgentDelegate, Arc<FakeCluster>, Arc<Mutex<Option<Value>>>) {
        let seen = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&seen);
        let router = Router::new().route(
            "/execute-stream",
            post(move |Json(request): Json<Value>| {
                let captured = Arc::clone(&captured);
                let body = body.clone();
                async move {
                    *captured.lock().unwrap() = Some(request);
                    if timeout_secs == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    body
                }
            }),
        );
        let base = serve(router).await;
        let port: u16 = base.rsplit(':').next().unwrap().parse().unwrap();

        let mut workers = WorkersConfig::default();
        workers.port = port;
        workers.full.timeout_secs = timeout_secs.max(1);
        workers.lightweight.timeout_secs = timeout_secs.max(1);
        let cluster = FakeCluster::ready("127.0.0.1").into_arc();
        let delegate = RemoteAgentDelegate::new(
            variant,
            &workers,
            KubernetesConfig::default(),
            cluster.clone(),
            reqwest::Client::new(),
            BTreeMap::from([("ANTHROPIC_API_KEY".to_string(), "sk-ant".to_string())]),
        );
        (delegate, cluster, seen)
    }

    #[test]
    fn test_variant_selection() {
        assert_eq!(WorkerVariant::from_executor("claude-code"), Some(WorkerVariant::Full));
        assert_eq!(WorkerVariant::from_executor("ptc"), Some(WorkerVariant::Lightweight));
        assert_eq!(WorkerVariant::from_executor("local"), None);
    }

    #[tokio::test]
    async fn test_full_worker_stream() {
        let body = [
            encode("iteration", &json!({"iteration": 1, "tool_name": "Write",
                "tool_input": {"file_path": "/w/app.py", "content": "x"}, "timestamp": "t1"})),
            encode("tool_result", &json!({"tool_use_id": "tu_1", "output": "ok"})),
            encode("iteration", &json!({"iteration": 2, "tool_name": "Bash", "tool_input": {"command": "pytest"}})),
            encode("result", &json!({"success": true, "cost_usd": 0.12, "latency_ms": 900.0,
                "task_result": {"summary": "built", "url": "http://app"},
                "artifacts": {"/w/app.py": "x"}})),
        ]
        .concat();
        let (delegate, cluster, seen) = delegate(WorkerVariant::Full, body, 30).await;
        let sink = Collect::default();

        let result = delegate.execute(&context("claude-code"), &sink).await;

        assert!(result.success);
        assert_eq!(result.output["summary"], "built");
        assert_eq!(result.output["iterations_count"], 2);
        assert!((result.cost_usd - 0.12).abs() < f64::EPSILON);
        assert_eq!(result.context_for_next["artifacts"]["/w/app.py"], "x");
        assert_eq!(result.reasoning_trace[0], "Claude Code Worker: 2 tool calls");

        let iterations = sink.0.lock().unwrap();
        assert_eq!(iterations.len(), 2);
        assert_eq!(iterations[0].tool_name, "write_file");
        assert_eq!(iterations[0].tool_input["path"], "/w/app.py");
        assert_eq!(iterations[0].tool_output, "ok");
        assert_eq!(iterations[1].tool_name, "run_command");

        let request = seen.lock().unwrap().clone().unwrap();
        assert_eq!(request["model"], "claude-sonnet-4-5-latest");
        assert_eq!(request["allowed_tools"][6], "mcp__k8s__kubectl_apply");

        let manifest = &cluster.created.lock().unwrap()[0];
        assert_eq!(manifest["metadata"]["labels"]["app"], "claude-code-worker");
        assert_eq!(manifest["spec"]["containers"][0]["name"], "worker");
        assert_eq!(manifest["spec"]["containers"][0]["resources"]["limits"]["memory"], "2048Mi");
        assert_eq!(manifest["spec"]["containers"][0]["env"][0]["name"], "ANTHROPIC_API_KEY");
        assert_eq!(cluster.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_frame_fails_execution() {
        let body = [
            encode("iteration", &json!({"iteration": 1, "tool_name": "kubectl_get", "tool_input": {}})),
            encode("error", &json!({"error": "No MCP tools discovered. Check MCP server URLs."})),
        ]
        .concat();
        let (delegate, cluster, seen) = delegate(WorkerVariant::Lightweight, body, 30).await;
        let result = delegate.execute(&context("ptc"), &Collect::default()).await;

        assert!(!result.success);
        assert_eq!(result.error(), Some("No MCP tools discovered. Check MCP server URLs."));
        assert_eq!(result.output["iterations_count"], 1);
        assert_eq!(result.reasoning_trace[0], "PTC Worker: 1 tool calls");
        let request = seen.lock().unwrap().clone().unwrap();
        assert_eq!(request["allowed_mcp_tools"], json!(["kubectl_apply"]));
        let manifest = &cluster.created.lock().unwrap()[0];
        assert!(manifest["metadata"]["name"].as_str().unwrap().starts_with("ptc-worker-"));
        assert_eq!(cluster.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_still_deletes_pod() {
        let (delegate, cluster, _) = delegate(WorkerVariant::Lightweight, String::new(), 0).await;
        let result = delegate.execute(&context("ptc"), &Collect::default()).await;
        assert!(!result.success);
        assert_eq!(result.error(), Some("worker timed out after 1s"));
        assert_eq!(cluster.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_execution_deletes_pod() {
        let (delegate, cluster, _) = delegate(WorkerVariant::Lightweight, String::new(), 0).await;
        let cancelled = tokio::time::timeout(
            Duration::from_millis(200),
            delegate.execute(&context("ptc"), &Collect::default()),
        )
        .await;
        assert!(cancelled.is_err());

        for _ in 0..50 {
            if !cluster.deleted.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cluster.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_provisioning_failure() {
        let delegate = RemoteAgentDelegate::new(
            WorkerVariant::Full,
            &WorkersConfig::default(),
            KubernetesConfig::default(),
            FakeCluster::unreachable().into_arc(),
            reqwest::Client::new(),
            BTreeMap::new(),
        );
        let result = delegate.execute(&context("claude-code"), &Collect::default()).await;
        assert!(!result.success);
        assert!(result.error().unwrap().contains("Kubernetes cluster unavailable"));
    }

    #[tokio::test]
    async fn test_stream_without_result() {
        let body = encode("iteration", &json!({"tool_name": "Read", "tool_input": {"file_path": "/a"}}));
        let (delegate, _, _) = delegate(WorkerVariant::Full, body, 30).await;
        let sink = Collect::default();
        let result = delegate.execute(&context("claude-code"), &sink).await;
        assert!(!result.success);
        assert_eq!(result.error(), Some("worker stream ended without a result"));
        assert_eq!(sink.0.lock().unwrap()[0].iteration, 1);
    }
}
