use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use super::format::{format_banner, format_iteration, format_outcome};
use crate::agent::AgentEvent;
use crate::config::Config;
use crate::executor::Executor;
use crate::sandbox::kubernetes::KubectlClient;
use crate::types::{SkillContext, SkillResult};

/// Reads a `SkillContext` from `path` (or stdin for `-`).
pub(crate) fn load_context(path: &Path) -> Result<SkillContext> {
    let raw = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("Failed to read context from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read context file: {}", path.display()))?
    };
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid skill context in {}", path.display()))
}

/// Executes one context. Iterations stream to stderr; the result JSON goes
/// to stdout. Returns whether the execution succeeded.
pub async fn run(config: Config, context_path: &Path, quiet: bool) -> Result<bool> {
    let ctx = load_context(context_path)?;

    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let cluster = Arc::new(KubectlClient::new(&config.kubernetes));
    let executor = Arc::new(
        Executor::new(config, http, cluster).context("Failed to configure sandbox backend")?,
    );

    let result = if quiet {
        executor.execute(&ctx).await
    } else {
        eprintln!("{}", format_banner(&ctx, &executor.route_label(&ctx)));
        let result = stream(&executor, &ctx).await;
        eprintln!("{}", format_outcome(&result));
        result
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );
    Ok(result.success)
}

/// Prints iterations as they arrive and returns the final result.
async fn stream(executor: &Arc<Executor>, ctx: &SkillContext) -> SkillResult {
    let mut events = Arc::clone(executor).stream(ctx.clone());
    let mut result = None;
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Iteration(iteration) => eprintln!("{}", format_iteration(&iteration)),
            AgentEvent::Result(r) => result = Some(r),
        }
    }
    result.unwrap_or_else(|| {
        SkillResult::failure(&ctx.skill_name, &ctx.model, "execution ended without a result")
    })
}
