//! In-memory sandbox backend for testing.
//!
//! Commands and code echo back, files live in a shared map, and every
//! create/close is counted so tests can assert teardown behavior.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{Sandbox, SandboxBackend, SandboxError, ToolOutput};
use crate::types::SandboxConfig;

#[derive(Debug, Clone, Default)]
pub(crate) struct MockBackend {
    creates: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    files: Arc<Mutex<BTreeMap<String, String>>>,
    commands: Arc<Mutex<Vec<String>>>,
    fail_create: bool,
    stall_reads: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `create` always fails with a readiness timeout.
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    /// A backend whose sandboxes never answer `read_file`.
    pub fn stalled_reads() -> Self {
        Self {
            stall_reads: true,
            ..Self::default()
        }
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(
        &self,
        _config: &SandboxConfig,
        _env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        if self.fail_create {
            return Err(SandboxError::readiness_timeout(
                "sandbox-mock",
                std::time::Duration::from_secs(30),
            ));
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSandbox {
            id: format!("sandbox-mock-{n}"),
            backend: self.clone(),
        }))
    }
}

struct MockSandbox {
    id: String,
    backend: MockBackend,
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_code(&self, code: &str) -> ToolOutput {
        Ok(format!("executed: {code}"))
    }

    async fn run_command(&self, command: &str) -> ToolOutput {
        self.backend
            .commands
            .lock()
            .unwrap()
            .push(command.to_string());
        if command.starts_with("exit 1") {
            return Ok("[exit_code] 1".to_string());
        }
        Ok(format!("$ {command}"))
    }

    async fn write_file(&self, path: &str, content: &str) -> ToolOutput {
        self.backend.put_file(path, content);
        Ok(format!("Written {} bytes to {path}", content.len()))
    }

    async fn read_file(&self, path: &str) -> ToolOutput {
        if self.backend.stall_reads {
            std::future::pending::<()>().await;
        }
        self.backend
            .file(path)
            .ok_or_else(|| format!("File not found: {path}"))
    }

    async fn close(&self) {
        self.backend.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend_tracks_lifecycle() {
        let backend = MockBackend::new();
        let sandbox = backend
            .create(&SandboxConfig::default(), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(backend.create_count(), 1);

        sandbox.write_file("/home/sandbox/a", "hi").await.unwrap();
        assert_eq!(sandbox.read_file("/home/sandbox/a").await, Ok("hi".to_string()));
        assert!(sandbox.read_file("/missing").await.is_err());

        sandbox.close().await;
        assert_eq!(backend.close_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let backend = MockBackend::failing();
        let result = backend
            .create(&SandboxConfig::default(), &BTreeMap::new())
            .await;
        assert!(result.err().unwrap().is_timeout());
        assert_eq!(backend.create_count(), 0);
    }
}
