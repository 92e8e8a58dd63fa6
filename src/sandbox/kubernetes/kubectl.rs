//! [`ClusterApi`] backed by the `kubectl` binary.
//!
//! Manifests go in on stdin:
//! ```bash
//! kubectl create -f - -o name
//! kubectl get pod NAME -n NS -o json
//! kubectl exec -i -n NS POD -c CONTAINER -- CMD...
//! kubectl delete pod NAME -n NS --grace-period=0 --force --wait=false
//! ```
//!
//! Every call except `exec` carries `--request-timeout`, so an API server
//! that accepts connections but never answers cannot stall provisioning.
//! `exec` streams for as long as the command runs and is bounded by its
//! caller instead.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{ClusterApi, PodStatus};
use crate::config::KubernetesConfig;
use crate::sandbox::SandboxError;

pub(crate) struct KubectlClient {
    binary: String,
    context: Option<String>,
    request_timeout_secs: u64,
}

/// What went wrong running kubectl, before it is mapped to a [`SandboxError`].
enum KubectlFailure {
    Spawn(String),
    Exit { code: Option<i32>, stderr: String },
}

impl std::fmt::Display for KubectlFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(message) => write!(f, "{message}"),
            Self::Exit { code, stderr } => {
                write!(f, "kubectl exited with {code:?}: {}", stderr.trim())
            }
        }
    }
}

impl KubectlClient {
    pub fn new(config: &KubernetesConfig) -> Self {
        Self {
            binary: config.kubectl.clone(),
            context: config.context.clone(),
            request_timeout_secs: config.request_timeout_secs,
        }
    }

    fn base_args(&self) -> Vec<String> {
        match &self.context {
            Some(context) => vec!["--context".to_string(), context.clone()],
            None => Vec::new(),
        }
    }

    /// `args` for a single API request, bounded by the request timeout.
    fn request(&self, args: &[&str]) -> Vec<String> {
        let mut args = owned(args);
        if self.request_timeout_secs > 0 {
            args.push(format!("--request-timeout={}s", self.request_timeout_secs));
        }
        args
    }

    async fn run(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> Result<String, KubectlFailure> {
        let mut full = self.base_args();
        full.extend(args);
        debug!("kubectl args: {:?}", full.iter().take(8).collect::<Vec<_>>());

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&full)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KubectlFailure::Spawn(format!("Failed to run '{}': {e}", self.binary)))?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&bytes)
                .await
                .map_err(|e| KubectlFailure::Spawn(format!("Failed to write kubectl stdin: {e}")))?;
            pipe.shutdown()
                .await
                .map_err(|e| KubectlFailure::Spawn(format!("Failed to close kubectl stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| KubectlFailure::Spawn(format!("kubectl did not finish: {e}")))?;

        if !output.status.success() {
            return Err(KubectlFailure::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| (*a).to_string()).collect()
}

#[async_trait]
impl ClusterApi for KubectlClient {
    async fn create_pod(&self, manifest: &Value) -> Result<(), SandboxError> {
        let body = serde_json::to_vec(manifest)
            .map_err(|e| SandboxError::cluster_unavailable(format!("invalid manifest: {e}")))?;
        self.run(self.request(&["create", "-f", "-", "-o", "name"]), Some(body))
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::cluster_unavailable(e.to_string()))
    }

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus, SandboxError> {
        let stdout = self
            .run(self.request(&["get", "pod", name, "-n", namespace, "-o", "json"]), None)
            .await
            .map_err(|e| SandboxError::cluster_unavailable(e.to_string()))?;
        let pod: Value = serde_json::from_str(&stdout)
            .map_err(|e| SandboxError::cluster_unavailable(format!("unreadable pod status: {e}")))?;
        Ok(PodStatus::from_pod(&pod))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<String, SandboxError> {
        let mut args = owned(&["exec"]);
        if stdin.is_some() {
            args.push("-i".to_string());
        }
        args.extend(owned(&["-n", namespace, pod, "-c", container, "--"]));
        args.extend(command.iter().cloned());

        self.run(args, stdin).await.map_err(|e| match e {
            KubectlFailure::Spawn(message) => SandboxError::cluster_unavailable(message),
            exit @ KubectlFailure::Exit { .. } => SandboxError::container_failed(exit.to_string()),
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), SandboxError> {
        self.run(
            self.request(&[
                "delete",
                "pod",
                name,
                "-n",
                namespace,
                "--grace-period=0",
                "--force",
                "--wait=false",
                "--ignore-not-found",
            ]),
            None,
        )
        .await
        .map(|_| ())
        .map_err(|e| SandboxError::cluster_unavailable(e.to_string()))
    }
}
