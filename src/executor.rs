//! Top-level entry point: routes a `SkillContext` to the local loop or a
//! worker pod and guarantees sandbox teardown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agent::{
    extract_artifacts, files_created, AgentEvent, AgentLoop, IterationSink, SandboxTools,
};
use crate::config::{BackendKind, Config};
use crate::delegate::{RemoteAgentDelegate, WorkerVariant};
use crate::llm::{HttpProviderFactory, ProviderFactory};
use crate::sandbox::{build_backend, ClusterApi, SandboxBackend, SandboxError, SandboxGuard};
use crate::types::{AgentIteration, SkillContext, SkillResult};

/// Owns everything an execution needs; cheap to share behind an `Arc`.
pub(crate) struct Executor {
    config: Config,
    http: reqwest::Client,
    backend: Arc<dyn SandboxBackend>,
    providers: Arc<dyn ProviderFactory>,
    cluster: Arc<dyn ClusterApi>,
}

impl Executor {
    /// Builds the configured backend and provider factory. Unsupported
    /// backend combinations fail here.
    pub fn new(
        config: Config,
        http: reqwest::Client,
        cluster: Arc<dyn ClusterApi>,
    ) -> Result<Self, SandboxError> {
        let backend = build_backend(&config, &http, Arc::clone(&cluster))?;
        let providers = Arc::new(HttpProviderFactory::new(config.llm.clone(), http.clone()));
        Ok(Self::with_parts(config, http, backend, providers, cluster))
    }

    pub fn with_parts(
        config: Config,
        http: reqwest::Client,
        backend: Arc<dyn SandboxBackend>,
        providers: Arc<dyn ProviderFactory>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        Self {
            config,
            http,
            backend,
            providers,
            cluster,
        }
    }

    /// The worker variant `ctx` is delegated to, if any. Delegation needs
    /// the Kubernetes backend and an Anthropic key for the worker.
    pub fn route(&self, ctx: &SkillContext) -> Option<WorkerVariant> {
        let variant = ctx
            .sandbox_config
            .as_ref()
            .and_then(|c| c.executor.as_deref())
            .and_then(WorkerVariant::from_executor)?;
        if self.config.sandbox.backend != BackendKind::Kubernetes {
            return None;
        }
        self.config.llm.anthropic_api_key.as_ref()?;
        Some(variant)
    }

    /// `local/<backend>` or `worker/<variant>`.
    pub fn route_label(&self, ctx: &SkillContext) -> String {
        self.route(ctx).map_or_else(
            || format!("local/{}", self.backend.name()),
            |variant| format!("worker/{variant}"),
        )
    }

    /// Runs to completion, discarding intermediate iterations.
    pub async fn execute(&self, ctx: &SkillContext) -> SkillResult {
        self.run(ctx, &Discard).await
    }

    /// Streams iterations then exactly one result. Dropping the receiver
    /// stops the execution at its next iteration and tears it down.
    pub fn stream(self: Arc<Self>, ctx: SkillContext) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(self.config.agent.event_buffer.max(1));
        tokio::spawn(async move {
            let result = self.run(&ctx, &tx).await;
            let _ = tx.send(AgentEvent::Result(result)).await;
        });
        rx
    }

    async fn run(&self, ctx: &SkillContext, sink: &dyn IterationSink) -> SkillResult {
        let start = Instant::now();
        info!(
            event = "execution_started",
            skill = %ctx.skill_name,
            model = %ctx.model,
            route = %self.route_label(ctx),
        );

        let mut result = match self.route(ctx) {
            Some(variant) => {
                RemoteAgentDelegate::new(
                    variant,
                    &self.config.workers,
                    self.config.kubernetes.clone(),
                    Arc::clone(&self.cluster),
                    self.http.clone(),
                    self.config.worker_env(),
                )
                .execute(ctx, sink)
                .await
            }
            None => self.run_local(ctx, sink).await,
        };

        result.latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            event = "execution_finished",
            skill = %ctx.skill_name,
            success = result.success,
            cost_usd = result.cost_usd,
            latency_ms = result.latency_ms,
        );
        result
    }

    async fn run_local(&self, ctx: &SkillContext, sink: &dyn IterationSink) -> SkillResult {
        let mut provider = match self.providers.create(&ctx.model, &ctx.system_prompt) {
            Ok(provider) => provider,
            Err(e) => return SkillResult::failure(&ctx.skill_name, &ctx.model, e.to_string()),
        };

        let sandbox_config = ctx.sandbox();
        let sandbox = match self.backend.create(&sandbox_config, &BTreeMap::new()).await {
            Ok(sandbox) => SandboxGuard::new(sandbox),
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    timeout = e.is_timeout(),
                    error = %e,
                    "sandbox provisioning failed"
                );
                return SkillResult::failure(&ctx.skill_name, &ctx.model, e.to_string());
            }
        };
        info!(event = "sandbox_created", backend = self.backend.name(), id = %sandbox.id());

        let outcome = AgentLoop::new(
            sandbox_config.max_iterations,
            &self.config.agent,
            &self.config.pricing,
        )
        .run(
            provider.as_mut(),
            &SandboxTools::new(&*sandbox),
            &ctx.prompt(),
            sink,
        )
        .await;

        let files = files_created(&outcome.output);
        let mut context_for_next = serde_json::Map::new();
        if outcome.succeeded() && !files.is_empty() {
            let limit = Duration::from_secs(self.config.agent.artifact_timeout_secs);
            let extraction = extract_artifacts(
                &*sandbox,
                &files,
                &self.config.agent.artifacts_dir,
                &ctx.skill_name,
            );
            match tokio::time::timeout(limit, extraction).await {
                Ok(Ok(context)) => context_for_next = context,
                Ok(Err(e)) => warn!("artifact extraction failed: {e:#}"),
                Err(_) => warn!(
                    timeout_secs = limit.as_secs(),
                    "artifact extraction timed out, continuing without artifacts"
                ),
            }
        }

        let id = sandbox.id().to_string();
        sandbox.close().await;
        info!(event = "sandbox_closed", backend = self.backend.name(), id = %id);

        let mut result = outcome.into_result(&ctx.skill_name, context_for_next);
        result.reasoning_trace.push(format!(
            "Sandbox: {} (template {})",
            self.backend.name(),
            sandbox_config.template
        ));
        result
    }
}

struct Discard;

#[async_trait::async_trait]
impl IterationSink for Discard {
    async fn emit(&self, _call_id: &str, _iteration: AgentIteration) -> bool {
        true
    }
}
