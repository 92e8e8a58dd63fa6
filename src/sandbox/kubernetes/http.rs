use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{launch_pod, ClusterApi, PodHandle, PodSpec, SERVICE_PORT};
use crate::config::KubernetesConfig;
use crate::sandbox::{sandbox_name, RuntimeClient, Sandbox, SandboxBackend, SandboxError, ToolOutput};
use crate::types::SandboxConfig;

/// Sandbox runtime pod reached over HTTP on its pod IP.
pub(crate) struct KubernetesHttpBackend {
    config: KubernetesConfig,
    cluster: Arc<dyn ClusterApi>,
    http: reqwest::Client,
}

impl KubernetesHttpBackend {
    pub fn new(config: KubernetesConfig, cluster: Arc<dyn ClusterApi>, http: reqwest::Client) -> Self {
        Self {
            config,
            cluster,
            http,
        }
    }
}

/// Pod spec for a sandbox runtime pod, shared by both Kubernetes backends.
pub(super) fn runtime_pod_spec(
    config: &KubernetesConfig,
    name: String,
    sandbox: &SandboxConfig,
    env: &BTreeMap<String, String>,
    ipc_volume: bool,
) -> PodSpec {
    PodSpec {
        name,
        namespace: config.namespace.clone(),
        app: "sandbox-runtime",
        container: "sandbox",
        image: config.image.clone(),
        image_pull_policy: config.image_pull_policy.clone(),
        cpu: sandbox.cpu.to_string(),
        memory: format!("{}Mi", sandbox.memory),
        env: env.clone(),
        probe_initial_delay_secs: 2,
        runtime_class: config.runtime_class.clone(),
        ipc_volume,
    }
}

#[async_trait]
impl SandboxBackend for KubernetesHttpBackend {
    fn name(&self) -> &'static str {
        "k8s"
    }

    async fn create(
        &self,
        config: &SandboxConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        let spec = runtime_pod_spec(&self.config, sandbox_name("sandbox"), config, env, false);
        let (pod, ip) = launch_pod(
            &self.cluster,
            &spec,
            Duration::from_secs(self.config.pod_ready_timeout_secs),
            Duration::from_millis(self.config.poll_interval_ms),
        )
        .await?;

        info!(event = "sandbox_created", backend = "k8s", pod = %spec.name, ip = %ip);
        Ok(Box::new(PodSandbox {
            client: RuntimeClient::new(self.http.clone(), format!("http://{ip}:{SERVICE_PORT}")),
            pod,
        }))
    }
}

struct PodSandbox {
    pod: PodHandle,
    client: RuntimeClient,
}

#[async_trait]
impl Sandbox for PodSandbox {
    fn id(&self) -> &str {
        self.pod.name()
    }

    async fn run_code(&self, code: &str) -> ToolOutput {
        self.client.run_code(code).await
    }

    async fn run_command(&self, command: &str) -> ToolOutput {
        self.client.run_command(command).await
    }

    async fn write_file(&self, path: &str, content: &str) -> ToolOutput {
        self.client.write_file(path, content).await
    }

    async fn read_file(&self, path: &str) -> ToolOutput {
        self.client.read_file(path).await
    }

    async fn close(&self) {
        self.pod.delete().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::kubernetes::fake::FakeCluster;

    fn config() -> KubernetesConfig {
        KubernetesConfig {
            pod_ready_timeout_secs: 1,
            poll_interval_ms: 20,
            runtime_class: Some("gvisor".to_string()),
            ..KubernetesConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_close_pod() {
        let cluster = FakeCluster::ready("10.0.0.5").into_arc();
        let backend = KubernetesHttpBackend::new(config(), cluster.clone(), reqwest::Client::new());
        let sandbox_config = SandboxConfig {
            memory: 256,
            ..SandboxConfig::default()
        };

        let sandbox = backend.create(&sandbox_config, &BTreeMap::new()).await.unwrap();
        assert!(sandbox.id().starts_with("sandbox-"));

        {
            let created = cluster.created.lock().unwrap();
            let manifest = &created[0];
            assert_eq!(manifest["metadata"]["namespace"], "agentura");
            assert_eq!(manifest["spec"]["runtimeClassName"], "gvisor");
            assert_eq!(
                manifest["spec"]["containers"][0]["resources"]["limits"]["memory"],
                "256Mi"
            );
            assert!(manifest["spec"].get("volumes").is_none());
        }

        sandbox.close().await;
        assert_eq!(*cluster.deleted.lock().unwrap(), vec![sandbox.id().to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_fails_fast() {
        let cluster = FakeCluster::unreachable().into_arc();
        let backend = KubernetesHttpBackend::new(config(), cluster, reqwest::Client::new());
        let err = backend
            .create(&SandboxConfig::default(), &BTreeMap::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_cluster_unavailable());
    }

    #[tokio::test]
    async fn test_pod_never_ready_times_out() {
        let cluster = FakeCluster::never_ready().into_arc();
        let backend = KubernetesHttpBackend::new(config(), cluster.clone(), reqwest::Client::new());
        let err = backend
            .create(&SandboxConfig::default(), &BTreeMap::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_timeout());
        assert_eq!(cluster.deleted.lock().unwrap().len(), 1);
    }
}
