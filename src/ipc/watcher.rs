use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{IpcError, IpcRequest, IpcResponse, IpcTool, IpcTransport, LocalTransport};
use crate::config::IpcConfig;
use crate::sandbox::ToolOutput;

/// Executes IPC tools on the sandbox side.
#[async_trait]
pub(crate) trait IpcHandler: Send + Sync {
    async fn run_command(&self, command: &str) -> ToolOutput;

    async fn run_code(&self, code: &str) -> ToolOutput;

    async fn write_file(&self, path: &str, content: &str) -> ToolOutput;

    async fn read_file(&self, path: &str) -> ToolOutput;
}

/// Sandbox side: scans `requests/`, executes, writes `responses/`.
pub(crate) struct IpcWatcher {
    requests: PathBuf,
    responses: PathBuf,
    poll: Duration,
}

impl IpcWatcher {
    pub fn new(config: &IpcConfig) -> Self {
        Self {
            requests: config.root.join("requests"),
            responses: config.root.join("responses"),
            poll: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Polls forever. Scan errors are logged and the loop keeps going.
    pub async fn run(self, handler: Arc<dyn IpcHandler>) {
        info!("IPC watcher started, watching {}", self.requests.display());
        loop {
            if let Err(e) = self.process_pending(handler.as_ref()).await {
                error!("IPC watcher error: {}", e);
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Handles every request currently on disk, in file name order.
    pub async fn process_pending(&self, handler: &dyn IpcHandler) -> Result<usize, IpcError> {
        let dirs = [
            self.requests.display().to_string(),
            self.responses.display().to_string(),
        ];
        LocalTransport.ensure_dirs(&dirs).await?;

        let mut pending = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.requests)
            .await
            .map_err(|e| IpcError::Transport(format!("read_dir {}: {e}", self.requests.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IpcError::Transport(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                pending.push(path);
            }
        }
        pending.sort();

        let mut handled = 0;
        for path in pending {
            if self.handle_file(&path, handler).await? {
                handled += 1;
            }
        }
        Ok(handled)
    }

    async fn handle_file(&self, path: &Path, handler: &dyn IpcHandler) -> Result<bool, IpcError> {
        let location = path.display().to_string();
        let Some(content) = LocalTransport.read(&location).await? else {
            return Ok(false);
        };
        // Consumed before execution, so a crash never re-runs a request.
        LocalTransport.remove(&location).await?;

        let request: IpcRequest = match serde_json::from_str(&content) {
            Ok(request) => request,
            Err(e) => {
                warn!("IPC: failed to parse request {}: {}", location, e);
                return Ok(false);
            }
        };
        debug!(id = %request.id, tool = %request.tool, "handling IPC request");

        let response = dispatch(handler, request).await;
        let body =
            serde_json::to_string(&response).map_err(|e| IpcError::Malformed(e.to_string()))?;
        let out = self.responses.join(format!("{}.json", response.id));
        LocalTransport.write(&out.display().to_string(), &body).await?;
        Ok(true)
    }
}

fn arg<'a>(args: &'a Map<String, Value>, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Runs one request against the handler.
pub(crate) async fn dispatch(handler: &dyn IpcHandler, request: IpcRequest) -> IpcResponse {
    let output = match request.tool.parse::<IpcTool>() {
        Ok(IpcTool::Execute) => handler.run_command(arg(&request.args, "command")).await,
        Ok(IpcTool::Code) => handler.run_code(arg(&request.args, "code")).await,
        Ok(IpcTool::FilesWrite) => {
            handler
                .write_file(arg(&request.args, "path"), arg(&request.args, "content"))
                .await
        }
        Ok(IpcTool::FilesRead) => handler.read_file(arg(&request.args, "path")).await,
        Err(unknown) => Err(unknown),
    };
    IpcResponse::from_output(request.id, output)
}
