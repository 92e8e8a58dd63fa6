//! Kubernetes pods as sandboxes.
//!
//! All cluster access goes through [`ClusterApi`]. The production client
//! drives `kubectl`, which picks up in-cluster service account credentials
//! and kubeconfig contexts the same way the rest of the tooling does.

mod file_ipc;
mod http;
mod kubectl;

pub(crate) use file_ipc::KubernetesIpcBackend;
pub(crate) use http::KubernetesHttpBackend;
pub(crate) use kubectl::KubectlClient;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::SandboxError;

pub(crate) const MANAGED_BY: &str = "agentura-executor";
pub(crate) const SERVICE_PORT: u16 = 8080;

/// The slice of the Kubernetes API the sandboxes need.
#[async_trait]
pub(crate) trait ClusterApi: Send + Sync {
    /// Creates a pod from a full manifest (namespace taken from metadata).
    async fn create_pod(&self, manifest: &Value) -> Result<(), SandboxError>;

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus, SandboxError>;

    /// Runs a command in a container and returns its stdout.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<String, SandboxError>;

    /// Deletes a pod immediately (zero grace period).
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), SandboxError>;
}

/// The parts of a pod's status readiness depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PodStatus {
    pub phase: String,
    pub pod_ip: Option<String>,
    pub ready: bool,
    /// Waiting/termination reason of the first container, if any.
    pub reason: Option<String>,
}

impl PodStatus {
    /// Reads a `Pod` object as returned by the API server.
    pub fn from_pod(pod: &Value) -> Self {
        let status = &pod["status"];
        let ready = status["conditions"].as_array().is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c["type"] == "Ready" && c["status"] == "True")
        });
        let reason = status["containerStatuses"]
            .as_array()
            .and_then(|statuses| statuses.first())
            .and_then(|s| {
                s["state"]["waiting"]["reason"]
                    .as_str()
                    .or_else(|| s["state"]["terminated"]["reason"].as_str())
            })
            .map(str::to_string);

        Self {
            phase: status["phase"].as_str().unwrap_or("Unknown").to_string(),
            pod_ip: status["podIP"]
                .as_str()
                .filter(|ip| !ip.is_empty())
                .map(str::to_string),
            ready,
            reason,
        }
    }

    /// Pods with `restartPolicy: Never` never come back from these phases.
    pub fn is_terminal(&self) -> bool {
        self.phase == "Failed" || self.phase == "Succeeded"
    }
}

// -----------------------------------------------------------------------------
// Manifests
// -----------------------------------------------------------------------------

/// Everything that varies between sandbox and worker pods.
#[derive(Debug, Clone)]
pub(crate) struct PodSpec {
    pub name: String,
    pub namespace: String,
    /// Value of the `app` label.
    pub app: &'static str,
    pub container: &'static str,
    pub image: String,
    pub image_pull_policy: String,
    pub cpu: String,
    pub memory: String,
    pub env: BTreeMap<String, String>,
    pub probe_initial_delay_secs: u32,
    pub runtime_class: Option<String>,
    /// Mount an in-memory `emptyDir` at `/ipc`.
    pub ipc_volume: bool,
}

impl PodSpec {
    /// Renders a bare `v1/Pod` manifest.
    pub fn to_manifest(&self) -> Value {
        let mut labels = json!({ "app": self.app, "managed-by": MANAGED_BY });
        if self.ipc_volume {
            labels["ipc"] = json!("file");
        }

        let resources = json!({ "cpu": self.cpu, "memory": self.memory });
        let mut container = json!({
            "name": self.container,
            "image": self.image,
            "imagePullPolicy": self.image_pull_policy,
            "ports": [{ "containerPort": SERVICE_PORT }],
            "resources": { "requests": resources, "limits": resources },
            "readinessProbe": {
                "httpGet": { "path": "/health", "port": SERVICE_PORT },
                "initialDelaySeconds": self.probe_initial_delay_secs,
                "periodSeconds": 2,
            },
        });
        if !self.env.is_empty() {
            container["env"] = self
                .env
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect();
        }

        let mut spec = json!({
            "restartPolicy": "Never",
            "automountServiceAccountToken": false,
        });
        if self.ipc_volume {
            container["volumeMounts"] = json!([{ "name": "ipc", "mountPath": "/ipc" }]);
            spec["volumes"] = json!([{
                "name": "ipc",
                "emptyDir": { "medium": "Memory", "sizeLimit": "10Mi" },
            }]);
        }
        spec["containers"] = json!([container]);
        if let Some(class) = &self.runtime_class {
            spec["runtimeClassName"] = json!(class);
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "labels": labels,
            },
            "spec": spec,
        })
    }
}

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

/// Polls pod status until it is Ready with an IP, fails, or `timeout` passes.
pub(crate) async fn wait_for_ready(
    api: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<String, SandboxError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, api.pod_status(namespace, name)).await {
            Ok(Ok(status)) => {
                if status.ready {
                    if let Some(ip) = status.pod_ip {
                        return Ok(ip);
                    }
                }
                if status.is_terminal() {
                    let reason = status.reason.unwrap_or(status.phase);
                    return Err(SandboxError::pod_failed(name, reason));
                }
                debug!(pod = name, phase = %status.phase, "pod not ready yet");
            }
            Ok(Err(e)) => debug!(pod = name, error = %e, "pod status unavailable"),
            Err(_) => return Err(SandboxError::readiness_timeout(name, timeout)),
        }

        if tokio::time::Instant::now() + poll > deadline {
            return Err(SandboxError::readiness_timeout(name, timeout));
        }
        tokio::time::sleep(poll).await;
    }
}

/// A pod this process created. Deleted by [`PodHandle::delete`], or in the
/// background when the handle is dropped first.
pub(crate) struct PodHandle {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    name: String,
    live: AtomicBool,
}

impl PodHandle {
    fn new(cluster: Arc<dyn ClusterApi>, spec: &PodSpec) -> Self {
        Self {
            cluster,
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
            live: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deletes the pod. Only the first call reaches the cluster.
    pub async fn delete(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            delete_pod_logged(self.cluster.as_ref(), &self.namespace, &self.name).await;
        }
    }
}

impl Drop for PodHandle {
    fn drop(&mut self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(pod = %self.name, "no runtime left to delete pod");
            return;
        };
        let cluster = Arc::clone(&self.cluster);
        let namespace = std::mem::take(&mut self.namespace);
        let name = std::mem::take(&mut self.name);
        debug!(pod = %name, "pod handle dropped, deleting in background");
        runtime.spawn(async move {
            delete_pod_logged(cluster.as_ref(), &namespace, &name).await;
        });
    }
}

/// Creates a pod and waits for it, all within `timeout`. Any failure after
/// the create request is sent deletes the pod, since a create that errored
/// on the client side may still have landed on the API server.
pub(crate) async fn launch_pod(
    api: &Arc<dyn ClusterApi>,
    spec: &PodSpec,
    timeout: Duration,
    poll: Duration,
) -> Result<(PodHandle, String), SandboxError> {
    let pod = PodHandle::new(Arc::clone(api), spec);
    let launch = async {
        api.create_pod(&spec.to_manifest()).await?;
        info!(event = "pod_created", pod = %spec.name, namespace = %spec.namespace, app = spec.app);
        wait_for_ready(api.as_ref(), &spec.namespace, &spec.name, timeout, poll).await
    };

    let outcome = tokio::time::timeout(timeout, launch)
        .await
        .unwrap_or_else(|_| Err(SandboxError::readiness_timeout(&spec.name, timeout)));
    match outcome {
        Ok(ip) => {
            info!(event = "pod_ready", pod = %spec.name, ip = %ip);
            Ok((pod, ip))
        }
        Err(e) => {
            pod.delete().await;
            Err(e)
        }
    }
}

/// Deletes a pod; failures only reach the log.
pub(crate) async fn delete_pod_logged(api: &dyn ClusterApi, namespace: &str, name: &str) {
    match api.delete_pod(namespace, name).await {
        Ok(()) => info!(event = "pod_deleted", pod = name),
        Err(e) => warn!("Failed to delete pod {}: {}", name, e),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory cluster for tests.

    use super::*;
    use std::sync::Mutex;

    type ExecHandler =
        dyn Fn(&[String], Option<&[u8]>) -> Result<String, SandboxError> + Send + Sync;

    pub(crate) struct FakeCluster {
        statuses: Mutex<Vec<PodStatus>>,
        fail_create: bool,
        hang_create: bool,
        exec_handler: Option<Box<ExecHandler>>,
        pub created: Mutex<Vec<Value>>,
        pub deleted: Mutex<Vec<String>>,
        pub execs: Mutex<Vec<Vec<String>>>,
    }

    impl FakeCluster {
        /// Reports the given statuses in order, repeating the last one.
        pub fn with_statuses(statuses: Vec<PodStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                fail_create: false,
                hang_create: false,
                exec_handler: None,
                created: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                execs: Mutex::new(Vec::new()),
            }
        }

        pub fn ready(ip: &str) -> Self {
            Self::with_statuses(vec![ready_status(ip)])
        }

        pub fn never_ready() -> Self {
            Self::with_statuses(vec![PodStatus {
                phase: "Pending".to_string(),
                ..PodStatus::default()
            }])
        }

        pub fn unreachable() -> Self {
            Self {
                fail_create: true,
                ..Self::never_ready()
            }
        }

        /// An API server that accepts the connection and never answers.
        pub fn hanging() -> Self {
            Self {
                hang_create: true,
                ..Self::never_ready()
            }
        }

        pub fn with_exec(
            mut self,
            handler: impl Fn(&[String], Option<&[u8]>) -> Result<String, SandboxError>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            self.exec_handler = Some(Box::new(handler));
            self
        }

        pub fn into_arc(self) -> Arc<Self> {
            Arc::new(self)
        }
    }

    pub(crate) fn ready_status(ip: &str) -> PodStatus {
        PodStatus {
            phase: "Running".to_string(),
            pod_ip: Some(ip.to_string()),
            ready: true,
            reason: None,
        }
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn create_pod(&self, manifest: &Value) -> Result<(), SandboxError> {
            if self.hang_create {
                std::future::pending::<()>().await;
            }
            if self.fail_create {
                return Err(SandboxError::cluster_unavailable(
                    "connection refused: https://10.255.0.1:6443",
                ));
            }
            self.created.lock().unwrap().push(manifest.clone());
            Ok(())
        }

        async fn pod_status(&self, _namespace: &str, _name: &str) -> Result<PodStatus, SandboxError> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses.first().cloned().unwrap_or_default())
            }
        }

        async fn exec(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: &str,
            command: &[String],
            stdin: Option<Vec<u8>>,
        ) -> Result<String, SandboxError> {
            self.execs.lock().unwrap().push(command.to_vec());
            match &self.exec_handler {
                Some(handler) => handler(command, stdin.as_deref()),
                None => Ok(String::new()),
            }
        }

        async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<(), SandboxError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }
}
