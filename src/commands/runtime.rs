use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::server::{self, SandboxRuntime};

/// Serves the sandbox runtime until the process is stopped.
pub async fn run(config: Config) -> Result<()> {
    let runtime = Arc::new(SandboxRuntime::new(config.runtime.clone()));
    if !runtime.spawn_ipc_watcher(&config.ipc) {
        info!(
            "No IPC volume at {}, serving HTTP only",
            config.ipc.root.display()
        );
    }
    server::serve(&config.runtime.bind, runtime.router()).await
}
