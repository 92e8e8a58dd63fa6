//! File-drop request/response transport between the executor and a sandbox.
//!
//! ```text
//! <root>/requests/<uuid>.json   {"id", "tool", "args"}     written by the requester
//! <root>/responses/<uuid>.json  {"id", "result", "error"}  written by the watcher
//! ```
//!
//! The watcher deletes each request before executing it and the requester
//! deletes each response after reading it, so every message is consumed
//! at most once.

mod client;
mod transport;
mod watcher;

pub(crate) use client::IpcClient;
pub(crate) use transport::{IpcTransport, LocalTransport, PodExecTransport};
pub(crate) use watcher::{IpcHandler, IpcWatcher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Errors on the requester side of an IPC round trip.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// No response appeared before the deadline.
    #[error("IPC timeout after {secs}s")]
    Timeout { secs: u64 },

    /// Reading or writing a message failed.
    #[error("IPC transport error: {0}")]
    Transport(String),

    /// A message file could not be decoded.
    #[error("malformed IPC message: {0}")]
    Malformed(String),
}

impl IpcError {
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            secs: duration.as_secs(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Tools the sandbox side understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcTool {
    Execute,
    Code,
    FilesWrite,
    FilesRead,
}

impl IpcTool {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Code => "code",
            Self::FilesWrite => "files_write",
            Self::FilesRead => "files_read",
        }
    }
}

impl std::str::FromStr for IpcTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execute" => Ok(Self::Execute),
            "code" => Ok(Self::Code),
            "files_write" => Ok(Self::FilesWrite),
            "files_read" => Ok(Self::FilesRead),
            other => Err(format!("unknown IPC tool: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl IpcRequest {
    /// A request with a fresh UUID.
    pub fn new(tool: IpcTool, args: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.as_str().to_string(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub id: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl IpcResponse {
    pub fn from_output(id: String, output: Result<String, String>) -> Self {
        match output {
            Ok(result) => Self {
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => Self {
                id,
                result: None,
                error: Some(error),
            },
        }
    }

    /// Converts to tool output: an `error` wins, a missing result is `(no output)`.
    pub fn into_output(self) -> Result<String, String> {
        match (self.error, self.result) {
            (Some(error), _) if !error.is_empty() => Err(error),
            (_, Some(result)) if !result.is_empty() => Ok(result),
            _ => Ok("(no output)".to_string()),
        }
    }
}

pub(crate) fn request_path(root: &str, id: &str) -> String {
    format!("{}/requests/{id}.json", root.trim_end_matches('/'))
}

pub(crate) fn response_path(root: &str, id: &str) -> String {
    format!("{}/responses/{id}.json", root.trim_end_matches('/'))
}
