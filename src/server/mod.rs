//! HTTP surfaces this binary serves from inside a sandbox or worker pod.

mod runtime;
mod worker;
mod workspace;

pub(crate) use runtime::SandboxRuntime;
pub(crate) use worker::WorkerServer;

use anyhow::{Context, Result};
use axum::Router;
use tracing::info;

/// Binds `addr` and serves `router` until the process exits.
pub(crate) async fn serve(addr: &str, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await.context("HTTP server failed")
}
