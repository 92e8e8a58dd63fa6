//! Ephemeral execution environments for agent tool calls.
//!
//! A [`SandboxBackend`] provisions one [`Sandbox`] per execution; the
//! sandbox exposes the four primitives the agent loop needs and is torn
//! down with [`Sandbox::close`]. Which backend is used is decided once,
//! from configuration, by [`build_backend`].

mod cloud;
mod docker;
mod error;
pub(crate) mod kubernetes;
#[cfg(test)]
pub(crate) mod mock;
mod runtime_client;

pub(crate) use cloud::CloudBackend;
pub(crate) use docker::DockerBackend;
pub(crate) use error::SandboxError;
pub(crate) use kubernetes::{ClusterApi, KubernetesHttpBackend, KubernetesIpcBackend};
pub(crate) use runtime_client::{format_code_output, format_command_output, RuntimeClient};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{BackendKind, Config, IpcMode};
use crate::types::SandboxConfig;

/// Result of one sandbox primitive. `Err` carries a message that is shown
/// to the model as `[error] <message>`.
pub(crate) type ToolOutput = Result<String, String>;

/// Renders a tool output as the text fed back to the model.
pub(crate) fn render(output: ToolOutput) -> String {
    match output {
        Ok(text) => text,
        Err(message) => format!("[error] {message}"),
    }
}

/// Provisions sandboxes.
#[async_trait]
pub(crate) trait SandboxBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Provisions a sandbox and blocks until it is ready or the readiness
    /// deadline passes. Partially created resources are removed on failure.
    async fn create(
        &self,
        config: &SandboxConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// A provisioned sandbox, owned by exactly one execution.
#[async_trait]
pub(crate) trait Sandbox: Send + Sync {
    /// Container id, pod name, or cloud sandbox id.
    fn id(&self) -> &str;

    async fn run_code(&self, code: &str) -> ToolOutput;

    async fn run_command(&self, command: &str) -> ToolOutput;

    async fn write_file(&self, path: &str, content: &str) -> ToolOutput;

    async fn read_file(&self, path: &str) -> ToolOutput;

    /// Best-effort teardown. Failures are logged, never returned.
    async fn close(&self);
}

/// Owns a live sandbox for one execution. [`SandboxGuard::close`] tears it
/// down; a guard dropped without closing (a cancelled execution) closes the
/// sandbox on a background task instead.
pub(crate) struct SandboxGuard {
    sandbox: Arc<dyn Sandbox>,
    open: bool,
}

impl SandboxGuard {
    pub fn new(sandbox: Box<dyn Sandbox>) -> Self {
        Self {
            sandbox: Arc::from(sandbox),
            open: true,
        }
    }

    pub async fn close(mut self) {
        self.open = false;
        self.sandbox.close().await;
    }
}

impl std::ops::Deref for SandboxGuard {
    type Target = dyn Sandbox;

    fn deref(&self) -> &Self::Target {
        self.sandbox.as_ref()
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id = %self.sandbox.id(), "no runtime left to close sandbox");
            return;
        };
        tracing::debug!(id = %self.sandbox.id(), "sandbox dropped while open, closing in background");
        let sandbox = Arc::clone(&self.sandbox);
        runtime.spawn(async move { sandbox.close().await });
    }
}

/// Builds the backend selected by configuration.
///
/// Combinations that cannot work (file IPC outside Kubernetes, cloud
/// sandboxes without an API key) fail here rather than mid-execution.
pub(crate) fn build_backend(
    config: &Config,
    http: &reqwest::Client,
    cluster: Arc<dyn ClusterApi>,
) -> Result<Arc<dyn SandboxBackend>, SandboxError> {
    match (config.sandbox.backend, config.sandbox.ipc_mode) {
        (BackendKind::Docker, IpcMode::Http) => {
            Ok(Arc::new(DockerBackend::new(config.docker.clone(), http.clone())))
        }
        (BackendKind::Kubernetes, IpcMode::Http) => Ok(Arc::new(KubernetesHttpBackend::new(
            config.kubernetes.clone(),
            cluster,
            http.clone(),
        ))),
        (BackendKind::Kubernetes, IpcMode::File) => Ok(Arc::new(KubernetesIpcBackend::new(
            config.kubernetes.clone(),
            config.ipc.clone(),
            cluster,
        ))),
        (BackendKind::Cloud, IpcMode::Http) => {
            let api_key = config.cloud.api_key.clone().ok_or_else(|| {
                SandboxError::unsupported("cloud backend requires E2B_API_KEY")
            })?;
            Ok(Arc::new(CloudBackend::new(
                config.cloud.clone(),
                api_key,
                http.clone(),
            )))
        }
        (backend, IpcMode::File) => Err(SandboxError::unsupported(format!(
            "file IPC requires the k8s backend, not {backend}"
        ))),
    }
}

/// Unique-enough name for a container or pod: `<prefix>-NNNNNNN`.
pub(crate) fn sandbox_name(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis().rem_euclid(10_000_000);
    format!("{prefix}-{millis:07}")
}
