//! Built-in file and shell tools for full-variant worker requests.
//!
//! Names and arguments follow the coding-agent convention the delegating
//! side maps back (`Read`, `Write`, `Edit`, `Bash`, `Glob`, `Grep`). Every
//! path is taken relative to the worker's workspace directory.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::runtime::SandboxRuntime;
use crate::agent::{optional, required, tool};
use crate::config::RuntimeConfig;
use crate::llm::ToolDefinition;
use crate::sandbox::{format_command_output, ToolOutput};

pub(crate) const WORKSPACE_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep"];

/// Files the worker itself writes into the workspace.
const BOOKKEEPING_FILES: &[&str] = &["INPUT.json", "TASK_RESULT.json"];
const MAX_MATCHES: usize = 200;

pub(crate) struct WorkspaceTools {
    runtime: SandboxRuntime,
    root: PathBuf,
    enabled: Vec<&'static str>,
}

impl WorkspaceTools {
    /// Enables the workspace tools named in `allowed`.
    pub fn new(root: PathBuf, command_timeout_secs: u64, allowed: &[String]) -> Self {
        let runtime = SandboxRuntime::new(RuntimeConfig {
            workdir: root.clone(),
            writable_roots: vec![root.clone(), PathBuf::from("/tmp")],
            command_timeout_secs,
            ..RuntimeConfig::default()
        });
        let enabled = WORKSPACE_TOOLS
            .iter()
            .copied()
            .filter(|name| allowed.iter().any(|a| a == name))
            .collect();
        Self {
            runtime,
            root,
            enabled,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }

    pub fn offers(&self, name: &str) -> bool {
        self.enabled.contains(&name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self) -> Result<(), String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| format!("Failed to create workspace {}: {e}", self.root.display()))
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        definitions()
            .into_iter()
            .filter(|d| self.offers(&d.name))
            .collect()
    }

    pub async fn execute(&self, name: &str, args: &Map<String, Value>) -> ToolOutput {
        match name {
            "Read" => self.runtime.read(required(args, "file_path")?).await,
            "Write" => {
                self.runtime
                    .write(required(args, "file_path")?, required(args, "content")?)
                    .await
            }
            "Edit" => self.edit(args).await,
            "Bash" => {
                let reply = self.runtime.run_shell(required(args, "command")?).await;
                Ok(format_command_output(&reply.stdout, &reply.stderr, reply.exit_code))
            }
            "Glob" => {
                let pattern = self.pattern(args, required(args, "pattern")?);
                let files = blocking(move || glob_files(&pattern)).await?;
                Ok(if files.is_empty() {
                    "No files found".to_string()
                } else {
                    files.join("\n")
                })
            }
            "Grep" => {
                let regex = Regex::new(required(args, "pattern")?)
                    .map_err(|e| format!("Invalid pattern: {e}"))?;
                let base = self.runtime.resolve(optional(args, "path").unwrap_or("."));
                let include = optional(args, "glob").unwrap_or("**/*").to_string();
                blocking(move || grep(&base, &include, &regex)).await
            }
            _ => Err(format!("Unknown tool: {name}")),
        }
    }

    /// Replaces `old_string` with `new_string`. The old string must occur
    /// exactly once unless `replace_all` is set.
    async fn edit(&self, args: &Map<String, Value>) -> ToolOutput {
        let path = required(args, "file_path")?;
        let old = required(args, "old_string")?;
        let new = args.get("new_string").and_then(Value::as_str).unwrap_or_default();
        let replace_all = args.get("replace_all").and_then(Value::as_bool).unwrap_or(false);

        let content = self.runtime.read(path).await?;
        let count = if old.is_empty() { 0 } else { content.matches(old).count() };
        let updated = match count {
            0 => return Err(format!("old_string not found in {path}")),
            1 => content.replacen(old, new, 1),
            n if replace_all => {
                debug!(path, replacements = n, "replacing every occurrence");
                content.replace(old, new)
            }
            n => {
                return Err(format!(
                    "old_string occurs {n} times in {path}; add context or set replace_all"
                ))
            }
        };
        self.runtime.write(path, &updated).await?;
        Ok(format!("Edited {path} ({count} replacement(s))"))
    }

    /// `pattern` under the optional `path` argument, as one glob string.
    fn pattern(&self, args: &Map<String, Value>, pattern: &str) -> String {
        let base = self.runtime.resolve(optional(args, "path").unwrap_or("."));
        base.join(pattern).to_string_lossy().into_owned()
    }
}

async fn blocking<T: Send + 'static>(
    work: impl FnOnce() -> Result<T, String> + Send + 'static,
) -> Result<T, String> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| format!("tool task failed: {e}"))?
}

/// Regular files matching `pattern`, sorted.
fn glob_files(pattern: &str) -> Result<Vec<String>, String> {
    let entries = glob::glob(pattern).map_err(|e| format!("Invalid pattern {pattern}: {e}"))?;
    let mut files: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .map(|p| p.display().to_string())
        .collect();
    files.sort();
    Ok(files)
}

/// `path:line:text` for every matching line, capped at [`MAX_MATCHES`].
fn grep(base: &Path, include: &str, regex: &Regex) -> Result<String, String> {
    let files = if base.is_file() {
        vec![base.display().to_string()]
    } else {
        glob_files(&base.join(include).to_string_lossy())?
    };

    let mut matches = Vec::new();
    'files: for file in files {
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        for (n, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(format!("{file}:{}:{line}", n + 1));
                if matches.len() == MAX_MATCHES {
                    matches.push(format!("... stopped after {MAX_MATCHES} matches"));
                    break 'files;
                }
            }
        }
    }
    Ok(if matches.is_empty() {
        "No matches found".to_string()
    } else {
        matches.join("\n")
    })
}

/// Every file under `root` keyed by relative path. Files that are not
/// UTF-8 text are reported by size only.
pub(crate) async fn collect_artifacts(root: &Path) -> Map<String, Value> {
    let root = root.to_path_buf();
    match tokio::task::spawn_blocking(move || artifacts_under(&root)).await {
        Ok(artifacts) => artifacts,
        Err(e) => {
            warn!(error = %e, "artifact collection failed");
            Map::new()
        }
    }
}

fn artifacts_under(root: &Path) -> Map<String, Value> {
    let mut artifacts = Map::new();
    let pattern = root.join("**").join("*").to_string_lossy().into_owned();
    let Ok(entries) = glob::glob(&pattern) else {
        return artifacts;
    };
    for path in entries.filter_map(Result::ok).filter(|p| p.is_file()) {
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let relative = relative.display().to_string();
        if BOOKKEEPING_FILES.contains(&relative.as_str()) {
            continue;
        }
        let content = match std::fs::read(&path) {
            Ok(bytes) => String::from_utf8(bytes)
                .unwrap_or_else(|e| format!("<binary: {} bytes>", e.as_bytes().len())),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "unreadable artifact");
                continue;
            }
        };
        artifacts.insert(relative, Value::String(content));
    }
    artifacts
}

/// `TASK_RESULT.json` from the workspace, when the model wrote one.
pub(crate) async fn read_task_result(root: &Path) -> Option<Map<String, Value>> {
    let text = tokio::fs::read_to_string(root.join("TASK_RESULT.json")).await.ok()?;
    match serde_json::from_str(&text) {
        Ok(Value::Object(result)) => Some(result),
        _ => {
            warn!("TASK_RESULT.json is not a JSON object, ignoring");
            None
        }
    }
}

fn definitions() -> Vec<ToolDefinition> {
    vec![
        tool(
            "Read",
            "Read a file from the workspace.",
            json!({"file_path": {"type": "string", "description": "Path to the file"}}),
            &["file_path"],
        ),
        tool(
            "Write",
            "Create or overwrite a file in the workspace.",
            json!({
                "file_path": {"type": "string", "description": "Path to the file"},
                "content": {"type": "string", "description": "Full file content"}
            }),
            &["file_path", "content"],
        ),
        tool(
            "Edit",
            "Replace an exact string in a file. The string must be unique unless replace_all is set.",
            json!({
                "file_path": {"type": "string", "description": "Path to the file"},
                "old_string": {"type": "string", "description": "Text to replace"},
                "new_string": {"type": "string", "description": "Replacement text"},
                "replace_all": {"type": "boolean", "description": "Replace every occurrence"}
            }),
            &["file_path", "old_string", "new_string"],
        ),
        tool(
            "Bash",
            "Run a shell command in the workspace.",
            json!({"command": {"type": "string", "description": "Shell command to execute"}}),
            &["command"],
        ),
        tool(
            "Glob",
            "List files matching a glob pattern such as **/*.py.",
            json!({
                "pattern": {"type": "string", "description": "Glob pattern"},
                "path": {"type": "string", "description": "Directory to search (default: workspace)"}
            }),
            &["pattern"],
        ),
        tool(
            "Grep",
            "Search file contents with a regular expression.",
            json!({
                "pattern": {"type": "string", "description": "Regular expression"},
                "path": {"type": "string", "description": "File or directory to search (default: workspace)"},
                "glob": {"type": "string", "description": "Only search files matching this glob"}
            }),
            &["pattern"],
        ),
    ]
}
