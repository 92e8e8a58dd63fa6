use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod agent;
mod commands;
mod config;
mod delegate;
mod executor;
mod ipc;
mod llm;
mod logging;
mod mcp;
mod sandbox;
mod server;
#[cfg(test)]
mod testutil;
mod types;

use config::Config;

#[derive(Parser)]
#[command(name = "agentura-executor")]
#[command(
    author,
    version,
    about = "Drives tool-calling models against ephemeral sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Config file (defaults to ./agentura.toml, then the user config dir)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one skill context and print the result as JSON
    Run {
        /// Path to a SkillContext JSON file, or `-` for stdin
        context: PathBuf,

        /// Only print the result JSON
        #[arg(short, long)]
        quiet: bool,
    },

    /// Serve the sandbox runtime (/execute, /code, /files) and the IPC watcher
    Runtime {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,
    },

    /// Serve the worker /execute-stream endpoint
    Worker {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let _log_guard = logging::init(&logging::LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { context, quiet } => {
            let succeeded = commands::run::run(config, &context, quiet).await?;
            if !succeeded {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Runtime { bind } => {
            if let Some(bind) = bind {
                config.runtime.bind = bind;
            }
            commands::runtime::run(config).await?;
        }
        Commands::Worker { bind } => {
            if let Some(bind) = bind {
                config.worker_server.bind = bind;
            }
            commands::worker::run(config).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
