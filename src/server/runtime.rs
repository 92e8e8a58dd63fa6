//! The sandbox-side runtime: `/health`, `/execute`, `/code`, `/files`,
//! plus the file-IPC watcher when the IPC volume is mounted.

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::path::{Component, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{IpcConfig, RuntimeConfig};
use crate::ipc::{IpcHandler, IpcWatcher};
use crate::sandbox::{format_code_output, format_command_output, ToolOutput};

const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct CommandReply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct CodeRequest {
    code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct CodeReply {
    pub output: String,
    pub error: String,
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    path: String,
}

/// Executes sandbox primitives on the local machine.
pub(crate) struct SandboxRuntime {
    config: RuntimeConfig,
}

impl SandboxRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/execute", post(execute))
            .route("/code", post(code))
            .route("/files", get(read_file).post(write_file))
            .with_state(self)
    }

    /// Starts the IPC watcher if `ipc.root` exists. Returns whether it did.
    pub fn spawn_ipc_watcher(self: &Arc<Self>, ipc: &IpcConfig) -> bool {
        if !ipc.root.exists() {
            return false;
        }
        let handler: Arc<dyn IpcHandler> = Arc::clone(self) as Arc<dyn IpcHandler>;
        tokio::spawn(IpcWatcher::new(ipc).run(handler));
        info!("IPC file watcher started on {}", ipc.root.display());
        true
    }

    /// `sh -c <command>` in the working directory.
    pub async fn run_shell(&self, command: &str) -> CommandReply {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        match self.capture(cmd).await {
            Ok(output) => CommandReply {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            },
            Err((exit_code, message)) => CommandReply {
                stdout: String::new(),
                stderr: format!("[error] {message}"),
                exit_code,
            },
        }
    }

    /// Runs `code` through the configured interpreter. A failing run
    /// reports the last line of stderr, which is where the exception lands.
    pub async fn run_python(&self, code: &str) -> CodeReply {
        let mut cmd = Command::new(&self.config.python);
        cmd.arg("-c").arg(code);
        match self.capture(cmd).await {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let error = if output.status.success() {
                    String::new()
                } else {
                    stderr
                        .lines()
                        .rev()
                        .find(|line| !line.trim().is_empty())
                        .map_or_else(
                            || format!("exited with {}", output.status),
                            |line| line.trim().to_string(),
                        )
                };
                CodeReply {
                    output: String::from_utf8_lossy(&output.stdout).into_owned(),
                    error,
                }
            }
            Err((_, message)) => CodeReply {
                output: String::new(),
                error: message,
            },
        }
    }

    async fn capture(&self, mut cmd: Command) -> Result<Output, (i32, String)> {
        cmd.current_dir(&self.config.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let secs = self.config.command_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(secs), cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err((1, format!("failed to start process: {e}"))),
            Err(_) => Err((TIMEOUT_EXIT_CODE, format!("Command timed out after {secs}s"))),
        }
    }

    /// Writes under one of the writable roots, creating parent directories.
    pub async fn write(&self, path: &str, content: &str) -> ToolOutput {
        let target = self.resolve(path);
        if !self
            .config
            .writable_roots
            .iter()
            .any(|root| target.starts_with(root))
        {
            return Err(format!(
                "Cannot write to {path}, use {} as your working directory",
                self.config.workdir.display()
            ));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_message(&e, path))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| io_message(&e, path))?;
        debug!(path = %target.display(), bytes = content.len(), "file written");
        Ok(format!("Written {} bytes to {path}", content.len()))
    }

    pub async fn read(&self, path: &str) -> ToolOutput {
        match tokio::fs::read_to_string(self.resolve(path)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(format!("File not found: {path}")),
            Err(e) => Err(io_message(&e, path)),
        }
    }

    /// Absolute, `..`-free form of `path`, relative paths taken from the
    /// working directory. Symlinks are not followed.
    pub(super) fn resolve(&self, path: &str) -> PathBuf {
        let joined = self.config.workdir.join(path);
        let mut resolved = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir => {}
                other => resolved.push(other),
            }
        }
        resolved
    }
}

fn io_message(e: &std::io::Error, path: &str) -> String {
    if e.kind() == ErrorKind::PermissionDenied {
        format!("Permission denied writing to {path}")
    } else {
        format!("{path}: {e}")
    }
}

#[async_trait]
impl IpcHandler for SandboxRuntime {
    async fn run_command(&self, command: &str) -> ToolOutput {
        let reply = self.run_shell(command).await;
        Ok(format_command_output(&reply.stdout, &reply.stderr, reply.exit_code))
    }

    async fn run_code(&self, code: &str) -> ToolOutput {
        let reply = self.run_python(code).await;
        Ok(format_code_output(&reply.output, &reply.error))
    }

    async fn write_file(&self, path: &str, content: &str) -> ToolOutput {
        self.write(path, content).await
    }

    async fn read_file(&self, path: &str) -> ToolOutput {
        self.read(path).await
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ready" }))
}

async fn execute(
    State(runtime): State<Arc<SandboxRuntime>>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandReply> {
    Json(runtime.run_shell(&request.command).await)
}

async fn code(
    State(runtime): State<Arc<SandboxRuntime>>,
    Json(request): Json<CodeRequest>,
) -> Json<CodeReply> {
    Json(runtime.run_python(&request.code).await)
}

async fn write_file(
    State(runtime): State<Arc<SandboxRuntime>>,
    Json(request): Json<WriteRequest>,
) -> Json<Value> {
    Json(match runtime.write(&request.path, &request.content).await {
        Ok(message) => json!({ "message": message }),
        Err(error) => json!({ "error": error }),
    })
}

async fn read_file(
    State(runtime): State<Arc<SandboxRuntime>>,
    Query(query): Query<ReadQuery>,
) -> Json<Value> {
    Json(match runtime.read(&query.path).await {
        Ok(content) => json!({ "content": content }),
        Err(error) => json!({ "error": error }),
    })
}
