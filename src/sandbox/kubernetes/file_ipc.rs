use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::http::runtime_pod_spec;
use super::{launch_pod, ClusterApi, PodHandle};
use crate::config::{IpcConfig, KubernetesConfig};
use crate::ipc::{IpcClient, IpcTool, PodExecTransport};
use crate::sandbox::{sandbox_name, Sandbox, SandboxBackend, SandboxError, ToolOutput};
use crate::types::SandboxConfig;

/// Sandbox runtime pod driven through files under `/ipc`, written and read
/// with `exec`. Needs no network path from the executor to the pod.
pub(crate) struct KubernetesIpcBackend {
    config: KubernetesConfig,
    ipc: IpcConfig,
    cluster: Arc<dyn ClusterApi>,
}

impl KubernetesIpcBackend {
    pub fn new(config: KubernetesConfig, ipc: IpcConfig, cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            config,
            ipc,
            cluster,
        }
    }
}

#[async_trait]
impl SandboxBackend for KubernetesIpcBackend {
    fn name(&self) -> &'static str {
        "k8s-file-ipc"
    }

    async fn create(
        &self,
        config: &SandboxConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        let spec = runtime_pod_spec(&self.config, sandbox_name("sandbox-ipc"), config, env, true);
        let (pod, _) = launch_pod(
            &self.cluster,
            &spec,
            Duration::from_secs(self.config.pod_ready_timeout_secs),
            Duration::from_millis(self.config.poll_interval_ms),
        )
        .await?;

        let transport = PodExecTransport::new(
            Arc::clone(&self.cluster),
            spec.namespace.clone(),
            spec.name.clone(),
            spec.container,
        );
        let client = IpcClient::new(Arc::new(transport), &self.ipc);
        if let Err(e) = client.init().await {
            pod.delete().await;
            return Err(SandboxError::container_failed(format!(
                "initializing IPC directories in {}: {e}",
                spec.name
            )));
        }

        info!(event = "sandbox_created", backend = "k8s-file-ipc", pod = %spec.name);
        Ok(Box::new(IpcPodSandbox { pod, client }))
    }
}

struct IpcPodSandbox {
    pod: PodHandle,
    client: IpcClient,
}

fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl Sandbox for IpcPodSandbox {
    fn id(&self) -> &str {
        self.pod.name()
    }

    async fn run_code(&self, code: &str) -> ToolOutput {
        self.client
            .call(IpcTool::Code, args(json!({ "code": code })))
            .await
    }

    async fn run_command(&self, command: &str) -> ToolOutput {
        self.client
            .call(IpcTool::Execute, args(json!({ "command": command })))
            .await
    }

    async fn write_file(&self, path: &str, content: &str) -> ToolOutput {
        self.client
            .call(
                IpcTool::FilesWrite,
                args(json!({ "path": path, "content": content })),
            )
            .await
    }

    async fn read_file(&self, path: &str) -> ToolOutput {
        self.client
            .call(IpcTool::FilesRead, args(json!({ "path": path })))
            .await
    }

    async fn close(&self) {
        self.pod.delete().await;
    }
}
