//! Tool catalog and dispatch onto sandbox primitives.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::llm::ToolDefinition;
use crate::sandbox::{Sandbox, ToolOutput};

pub(crate) const TASK_COMPLETE: &str = "task_complete";

const DEFAULT_REPO_DIR: &str = "/home/user/repo";

/// Something that can run the tools it advertises.
#[async_trait]
pub(crate) trait ToolExecutor: Send + Sync {
    /// Tools offered to the model, `task_complete` included.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Runs one tool. `task_complete` is handled by the loop and never
    /// reaches an executor.
    async fn execute(&self, name: &str, args: &Map<String, Value>) -> ToolOutput;
}

/// File, shell, code, and git tools backed by one sandbox.
pub(crate) struct SandboxTools<'a> {
    sandbox: &'a dyn Sandbox,
}

impl<'a> SandboxTools<'a> {
    pub fn new(sandbox: &'a dyn Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ToolExecutor for SandboxTools<'_> {
    fn definitions(&self) -> Vec<ToolDefinition> {
        sandbox_tool_definitions()
    }

    async fn execute(&self, name: &str, args: &Map<String, Value>) -> ToolOutput {
        match name {
            "write_file" => {
                self.sandbox
                    .write_file(required(args, "path")?, required(args, "content")?)
                    .await
            }
            "read_file" => self.sandbox.read_file(required(args, "path")?).await,
            "run_command" => self.sandbox.run_command(required(args, "command")?).await,
            "run_code" => self.sandbox.run_code(required(args, "code")?).await,
            "clone_repo" | "create_branch" | "create_pr" => {
                self.sandbox.run_command(&git_command(name, args)?).await
            }
            _ => Err(format!("Unknown tool: {name}")),
        }
    }
}

/// Renders a compound git tool as one shell command with quoted arguments.
pub(crate) fn git_command(name: &str, args: &Map<String, Value>) -> Result<String, String> {
    use shell_words::quote;

    match name {
        "clone_repo" => {
            let url = required(args, "repo_url")?;
            let branch = optional(args, "branch").unwrap_or("main");
            let target = optional(args, "target_dir").unwrap_or(DEFAULT_REPO_DIR);
            Ok(format!(
                "git clone --depth 1 --branch {} {} {}",
                quote(branch),
                quote(url),
                quote(target)
            ))
        }
        "create_branch" => {
            let branch = required(args, "branch_name")?;
            let dir = optional(args, "base_dir").unwrap_or(DEFAULT_REPO_DIR);
            Ok(format!("cd {} && git checkout -b {}", quote(dir), quote(branch)))
        }
        "create_pr" => {
            let title = quote(required(args, "title")?);
            let body = quote(required(args, "body")?);
            let dir = optional(args, "base_dir").unwrap_or(DEFAULT_REPO_DIR);
            Ok(format!(
                "cd {} && git add -A && git commit -m {title} && git push -u origin HEAD \
                 && gh pr create --title {title} --body {body}",
                quote(dir)
            ))
        }
        _ => Err(format!("Unknown tool: {name}")),
    }
}

pub(crate) fn required<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required argument: {key}"))
}

pub(crate) fn optional<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|v| !v.is_empty())
}

/// The completion tool; its arguments become the structured result.
pub(crate) fn task_complete_definition() -> ToolDefinition {
    tool(
        TASK_COMPLETE,
        "Signal that the task is finished. Provide a summary of what was built and any output URLs or file paths.",
        json!({
            "summary": {"type": "string", "description": "Summary of what was accomplished"},
            "files_created": {
                "type": "array",
                "items": {"type": "string"},
                "description": "List of key files created"
            },
            "url": {"type": "string", "description": "Preview/staging URL if applicable"}
        }),
        &["summary"],
    )
}

fn sandbox_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        tool(
            "write_file",
            "Write content to a file in the sandbox filesystem.",
            json!({
                "path": {"type": "string", "description": "Absolute file path in the sandbox"},
                "content": {"type": "string", "description": "File content to write"}
            }),
            &["path", "content"],
        ),
        tool(
            "read_file",
            "Read a file from the sandbox filesystem.",
            json!({"path": {"type": "string", "description": "Absolute file path to read"}}),
            &["path"],
        ),
        tool(
            "run_command",
            "Run a shell command in the sandbox (e.g. npm install, pip install, ls, etc.).",
            json!({"command": {"type": "string", "description": "Shell command to execute"}}),
            &["command"],
        ),
        tool(
            "run_code",
            "Execute Python code in the sandbox and return the output.",
            json!({"code": {"type": "string", "description": "Python code to execute"}}),
            &["code"],
        ),
        tool(
            "clone_repo",
            "Clone a git repository into the sandbox. Uses --depth 1 for speed.",
            json!({
                "repo_url": {"type": "string", "description": "Git repository URL (HTTPS or SSH)"},
                "branch": {"type": "string", "description": "Branch to clone (default: main)"},
                "target_dir": {"type": "string", "description": "Directory to clone into (default: /home/user/repo)"}
            }),
            &["repo_url"],
        ),
        tool(
            "create_branch",
            "Create and checkout a new git branch in a repository.",
            json!({
                "branch_name": {"type": "string", "description": "Name for the new branch"},
                "base_dir": {"type": "string", "description": "Repository directory (default: /home/user/repo)"}
            }),
            &["branch_name"],
        ),
        tool(
            "create_pr",
            "Stage all changes, commit, push, and create a GitHub PR.",
            json!({
                "title": {"type": "string", "description": "PR title (conventional commit format)"},
                "body": {"type": "string", "description": "PR body in markdown"},
                "base_dir": {"type": "string", "description": "Repository directory (default: /home/user/repo)"}
            }),
            &["title", "body"],
        ),
        task_complete_definition(),
    ]
}

pub(crate) fn tool(name: &str, description: &str, properties: Value, required: &[&str]) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::MockBackend;
    use crate::sandbox::SandboxBackend;
    use crate::types::SandboxConfig;
    use std::collections::BTreeMap;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_catalog() {
        let names: Vec<String> = sandbox_tool_definitions().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "write_file",
                "read_file",
                "run_command",
                "run_code",
                "clone_repo",
                "create_branch",
                "create_pr",
                "task_complete"
            ]
        );
        let write = &sandbox_tool_definitions()[0];
        assert_eq!(write.input_schema["required"], json!(["path", "content"]));
    }

    fn words(command: &str) -> Vec<String> {
        shell_words::split(command).unwrap()
    }

    #[test]
    fn test_git_commands_quote_arguments() {
        let clone =
            git_command("clone_repo", &args(json!({"repo_url": "https://github.com/acme/web.git"})))
                .unwrap();
        assert_eq!(
            words(&clone),
            vec![
                "git",
                "clone",
                "--depth",
                "1",
                "--branch",
                "main",
                "https://github.com/acme/web.git",
                "/home/user/repo"
            ]
        );

        let branch =
            git_command("create_branch", &args(json!({"branch_name": "feat/x; rm -rf /"}))).unwrap();
        assert_eq!(words(&branch).last().unwrap(), "feat/x; rm -rf /");

        let pr = git_command(
            "create_pr",
            &args(json!({"title": "fix: it's \"quoted\"", "body": "line1\nline2", "base_dir": "/w"})),
        )
        .unwrap();
        let pr = words(&pr);
        assert_eq!(pr[..2], ["cd", "/w"]);
        assert!(pr.contains(&"fix: it's \"quoted\"".to_string()));
        assert_eq!(pr.last().unwrap(), "line1\nline2");
    }

    #[test]
    fn test_missing_argument() {
        assert_eq!(
            git_command("create_pr", &args(json!({"title": "t"}))).unwrap_err(),
            "missing required argument: body"
        );
    }

    #[tokio::test]
    async fn test_dispatch_to_sandbox() {
        let backend = MockBackend::new();
        let sandbox = backend
            .create(&SandboxConfig::default(), &BTreeMap::new())
            .await
            .unwrap();
        let tools = SandboxTools::new(sandbox.as_ref());

        let written = tools
            .execute("write_file", &args(json!({"path": "/home/sandbox/a.py", "content": "x=1"})))
            .await;
        assert_eq!(written, Ok("Written 3 bytes to /home/sandbox/a.py".to_string()));
        assert_eq!(backend.file("/home/sandbox/a.py").as_deref(), Some("x=1"));

        tools
            .execute("create_branch", &args(json!({"branch_name": "fix"})))
            .await
            .unwrap();
        assert_eq!(backend.commands().len(), 1);
        assert!(backend.commands()[0].ends_with("git checkout -b fix"));

        assert_eq!(
            tools.execute("deploy", &Map::new()).await,
            Err("Unknown tool: deploy".to_string())
        );
        assert_eq!(
            tools.execute("read_file", &Map::new()).await,
            Err("missing required argument: path".to_string())
        );
    }
}
