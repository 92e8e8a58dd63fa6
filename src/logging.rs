use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// How the subscriber is wired up.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogOptions {
    pub verbose: bool,
    pub json: bool,
    pub file: Option<PathBuf>,
}

/// Installs the global subscriber. Logs go to stderr (stdout carries
/// results) and optionally to a file. Keep the returned guard alive until
/// exit so buffered file output is flushed.
pub(crate) fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(options.verbose)));

    let (file_layer, guard) = match &options.file {
        Some(path) => {
            let (directory, file_name) = split_path(path)?;
            fs::create_dir_all(&directory).with_context(|| {
                format!("Failed to create log directory at {}", directory.display())
            })?;
            let (non_blocking, guard) =
                tracing_appender::non_blocking(rolling::never(directory, file_name));
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
    let installed = if options.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.context("Failed to initialize tracing subscriber")?;

    Ok(guard)
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "agentura_executor=debug"
    } else {
        "agentura_executor=info"
    }
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name: {}", path.display()))?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        let (dir, name) = split_path(Path::new("/var/log/agentura/run.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/agentura"));
        assert_eq!(name, "run.log");

        let (dir, name) = split_path(Path::new("run.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "run.log");

        assert!(split_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "agentura_executor=info");
        assert_eq!(default_directive(true), "agentura_executor=debug");
    }
}
