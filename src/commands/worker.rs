use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::llm::HttpProviderFactory;
use crate::server::{self, WorkerServer};

/// Serves `/execute-stream` until the process is stopped.
pub async fn run(config: Config) -> Result<()> {
    if config.llm.anthropic_api_key.is_none() && config.llm.openrouter_api_key.is_none() {
        warn!("No provider key set; every execution will fail until one is configured");
    }
    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let providers = Arc::new(HttpProviderFactory::new(config.llm.clone(), http.clone()));
    let worker = Arc::new(WorkerServer::new(
        config.worker_server.clone(),
        config.agent.clone(),
        config.pricing.clone(),
        providers,
        http,
    ));
    server::serve(&config.worker_server.bind, worker.router()).await
}
