//! Pulls files the model reported creating out of the sandbox.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{info, warn};

use crate::sandbox::Sandbox;

/// The `files_created` list from a final output, ignoring non-strings.
pub(crate) fn files_created(output: &Map<String, Value>) -> Vec<String> {
    output
        .get("files_created")
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Copies each file into `<root>/<skill>-<UTC timestamp>/<basename>` and
/// returns the `{artifacts_dir, artifacts}` context for downstream skills.
///
/// Files that cannot be read are skipped.
pub(crate) async fn extract_artifacts(
    sandbox: &dyn Sandbox,
    files: &[String],
    root: &Path,
    skill_name: &str,
) -> Result<Map<String, Value>> {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let dir = root.join(format!("{skill_name}-{stamp}"));
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create artifacts dir: {}", dir.display()))?;

    let mut artifacts = Map::new();
    for path in files {
        let Some(name) = Path::new(path).file_name() else {
            warn!(path = %path, "artifact path has no file name, skipping");
            continue;
        };
        let content = match sandbox.read_file(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path, error = %e, "artifact read failed, skipping");
                continue;
            }
        };
        let target = dir.join(name);
        tokio::fs::write(&target, &content)
            .await
            .with_context(|| format!("Failed to write artifact: {}", target.display()))?;
        artifacts.insert(path.clone(), Value::String(content));
    }

    info!(event = "artifacts_extracted", dir = %dir.display(), count = artifacts.len());
    let mut context = Map::new();
    context.insert(
        "artifacts_dir".to_string(),
        Value::String(dir.display().to_string()),
    );
    context.insert("artifacts".to_string(), Value::Object(artifacts));
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::sandbox::mock::MockBackend;
    use crate::sandbox::{RuntimeClient, SandboxBackend, ToolOutput};
    use crate::server::SandboxRuntime;
    use crate::testutil::serve;
    use crate::types::SandboxConfig;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_files_created() {
        let output = json!({"files_created": ["/a.py", 3, "/b.md"]});
        assert_eq!(files_created(output.as_object().unwrap()), vec!["/a.py", "/b.md"]);
        assert!(files_created(&Map::new()).is_empty());
    }

    #[tokio::test]
    async fn test_extracts_readable_files() {
        let backend = MockBackend::new();
        backend.put_file("/home/sandbox/app/main.py", "print('hi')");
        let sandbox = backend
            .create(&SandboxConfig::default(), &BTreeMap::new())
            .await
            .unwrap();
        let root = TempDir::new().unwrap();

        let context = extract_artifacts(
            sandbox.as_ref(),
            &["/home/sandbox/app/main.py".to_string(), "/missing.txt".to_string()],
            root.path(),
            "app-builder",
        )
        .await
        .unwrap();

        let dir = Path::new(context["artifacts_dir"].as_str().unwrap());
        assert!(dir.file_name().unwrap().to_str().unwrap().starts_with("app-builder-"));
        assert_eq!(
            std::fs::read_to_string(dir.join("main.py")).unwrap(),
            "print('hi')"
        );
        let artifacts = context["artifacts"].as_object().unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts["/home/sandbox/app/main.py"], "print('hi')");
    }

    /// A sandbox reached through the runtime's HTTP surface.
    struct HttpSandbox(RuntimeClient);

    #[async_trait::async_trait]
    impl Sandbox for HttpSandbox {
        fn id(&self) -> &str {
            "sandbox-http"
        }

        async fn run_code(&self, code: &str) -> ToolOutput {
            self.0.run_code(code).await
        }

        async fn run_command(&self, command: &str) -> ToolOutput {
            self.0.run_command(command).await
        }

        async fn write_file(&self, path: &str, content: &str) -> ToolOutput {
            self.0.write_file(path, content).await
        }

        async fn read_file(&self, path: &str) -> ToolOutput {
            self.0.read_file(path).await
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_missing_files_over_http_are_skipped() {
        let workdir = TempDir::new().unwrap();
        std::fs::write(workdir.path().join("main.py"), "print('hi')").unwrap();
        let runtime = SandboxRuntime::new(RuntimeConfig {
            workdir: workdir.path().to_path_buf(),
            writable_roots: vec![workdir.path().to_path_buf()],
            ..RuntimeConfig::default()
        });
        let base = serve(Arc::new(runtime).router()).await;
        let sandbox = HttpSandbox(RuntimeClient::new(reqwest::Client::new(), base));
        let root = TempDir::new().unwrap();

        let context = extract_artifacts(
            &sandbox,
            &["main.py".to_string(), "missing.txt".to_string()],
            root.path(),
            "app-builder",
        )
        .await
        .unwrap();

        let artifacts = context["artifacts"].as_object().unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts["main.py"], "print('hi')");
        let dir = Path::new(context["artifacts_dir"].as_str().unwrap());
        assert!(!dir.join("missing.txt").exists());
    }
}
