use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{request_path, response_path, IpcError, IpcRequest, IpcResponse, IpcTool, IpcTransport};
use crate::config::IpcConfig;
use crate::sandbox::ToolOutput;

/// Requester side: drops requests and polls for their responses.
pub(crate) struct IpcClient {
    transport: Arc<dyn IpcTransport>,
    root: String,
    poll: Duration,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(transport: Arc<dyn IpcTransport>, config: &IpcConfig) -> Self {
        Self {
            transport,
            root: config.root.display().to_string(),
            poll: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Creates the request and response directories.
    pub async fn init(&self) -> Result<(), IpcError> {
        let root = self.root.trim_end_matches('/');
        self.transport
            .ensure_dirs(&[format!("{root}/requests"), format!("{root}/responses")])
            .await
    }

    pub async fn send(&self, request: &IpcRequest) -> Result<(), IpcError> {
        let body =
            serde_json::to_string(request).map_err(|e| IpcError::Malformed(e.to_string()))?;
        self.transport
            .write(&request_path(&self.root, &request.id), &body)
            .await
    }

    /// Waits for the response to `id` and deletes it once read.
    pub async fn poll_response(&self, id: &str) -> Result<IpcResponse, IpcError> {
        self.poll_until(id, Instant::now() + self.timeout).await
    }

    /// Transport calls count against `deadline` too: an exec that never
    /// returns ends in a timeout like a response that never lands.
    async fn poll_until(&self, id: &str, deadline: Instant) -> Result<IpcResponse, IpcError> {
        let path = response_path(&self.root, id);
        let poll = async {
            loop {
                if let Some(content) = self.transport.read(&path).await? {
                    self.transport.remove(&path).await?;
                    return serde_json::from_str(&content)
                        .map_err(|e| IpcError::Malformed(format!("{path}: {e}")));
                }
                if Instant::now() >= deadline {
                    return Err(IpcError::timeout(self.timeout));
                }
                tokio::time::sleep(self.poll).await;
            }
        };
        tokio::time::timeout_at(deadline, poll)
            .await
            .unwrap_or_else(|_| Err(IpcError::timeout(self.timeout)))
    }

    /// Sends a request and waits for its response, both within the timeout.
    pub async fn request(&self, tool: IpcTool, args: Map<String, Value>) -> Result<IpcResponse, IpcError> {
        let deadline = Instant::now() + self.timeout;
        let request = IpcRequest::new(tool, args);
        debug!(id = %request.id, tool = tool.as_str(), "sending IPC request");
        tokio::time::timeout_at(deadline, self.send(&request))
            .await
            .unwrap_or_else(|_| Err(IpcError::timeout(self.timeout)))?;
        self.poll_until(&request.id, deadline).await
    }

    /// One round trip, flattened to tool output.
    pub async fn call(&self, tool: IpcTool, args: Map<String, Value>) -> ToolOutput {
        self.request(tool, args)
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    warn!(tool = tool.as_str(), "IPC request got no response");
                }
                e.to_string()
            })
            .and_then(IpcResponse::into_output)
    }
}
