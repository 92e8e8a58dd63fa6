use async_trait::async_trait;
use base64::Engine;
use std::path::Path;
use std::sync::Arc;

use super::IpcError;
use crate::sandbox::ClusterApi;

const NOT_FOUND_MARKER: &str = "__IPC_NOT_FOUND__";

/// Moves message files in and out of an IPC root.
///
/// Writes must be atomic: a reader never observes a partially written file.
#[async_trait]
pub(crate) trait IpcTransport: Send + Sync {
    async fn ensure_dirs(&self, dirs: &[String]) -> Result<(), IpcError>;

    async fn write(&self, path: &str, content: &str) -> Result<(), IpcError>;

    /// `Ok(None)` when the file does not exist (yet).
    async fn read(&self, path: &str) -> Result<Option<String>, IpcError>;

    async fn remove(&self, path: &str) -> Result<(), IpcError>;
}

/// Local filesystem, used by the sandbox side and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LocalTransport;

#[async_trait]
impl IpcTransport for LocalTransport {
    async fn ensure_dirs(&self, dirs: &[String]) -> Result<(), IpcError> {
        for dir in dirs {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| IpcError::Transport(format!("mkdir {dir}: {e}")))?;
        }
        Ok(())
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), IpcError> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IpcError::Transport(format!("mkdir {}: {e}", parent.display())))?;
        }
        let tmp = format!("{path}.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| IpcError::Transport(format!("write {tmp}: {e}")))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| IpcError::Transport(format!("rename {tmp}: {e}")))
    }

    async fn read(&self, path: &str) -> Result<Option<String>, IpcError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IpcError::Transport(format!("read {path}: {e}"))),
        }
    }

    async fn remove(&self, path: &str) -> Result<(), IpcError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IpcError::Transport(format!("remove {path}: {e}"))),
        }
    }
}

/// Files inside a pod, reached through `exec`.
///
/// Content is streamed base64-encoded on stdin, so payload size is not
/// limited by the exec argument list.
pub(crate) struct PodExecTransport {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    pod: String,
    container: String,
}

impl PodExecTransport {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }

    async fn exec(&self, command: Vec<String>, stdin: Option<Vec<u8>>) -> Result<String, IpcError> {
        self.cluster
            .exec(&self.namespace, &self.pod, &self.container, &command, stdin)
            .await
            .map_err(|e| IpcError::Transport(e.to_string()))
    }
}

fn shell(script: String) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script]
}

/// Script that decodes stdin into `path` via a temp file and rename.
pub(crate) fn write_script(path: &str) -> String {
    let dir = Path::new(path)
        .parent()
        .map_or_else(|| "/".to_string(), |p| p.display().to_string());
    let tmp = format!("{path}.tmp");
    format!(
        "mkdir -p {} && base64 -d > {} && mv {} {}",
        shell_words::quote(&dir),
        shell_words::quote(&tmp),
        shell_words::quote(&tmp),
        shell_words::quote(path),
    )
}

pub(crate) fn read_script(path: &str) -> String {
    format!(
        "cat {} 2>/dev/null || echo '{NOT_FOUND_MARKER}'",
        shell_words::quote(path)
    )
}

#[async_trait]
impl IpcTransport for PodExecTransport {
    async fn ensure_dirs(&self, dirs: &[String]) -> Result<(), IpcError> {
        let mut command = vec!["mkdir".to_string(), "-p".to_string()];
        command.extend(dirs.iter().cloned());
        self.exec(command, None).await.map(|_| ())
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), IpcError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        self.exec(shell(write_script(path)), Some(encoded.into_bytes()))
            .await
            .map(|_| ())
    }

    async fn read(&self, path: &str) -> Result<Option<String>, IpcError> {
        let output = self.exec(shell(read_script(path)), None).await?;
        if output.trim_end() == NOT_FOUND_MARKER {
            Ok(None)
        } else {
            Ok(Some(output))
        }
    }

    async fn remove(&self, path: &str) -> Result<(), IpcError> {
        self.exec(vec!["rm".to_string(), "-f".to_string(), path.to_string()], None)
            .await
            .map(|_| ())
    }
}
