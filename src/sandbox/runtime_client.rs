//! HTTP client for the sandbox runtime (`/health`, `/execute`, `/code`, `/files`).
//!
//! Used by every backend whose sandbox is reachable over HTTP: the Docker
//! container on a published host port and the Kubernetes pod on its IP.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{SandboxError, ToolOutput};

const EXEC_TIMEOUT: Duration = Duration::from_secs(120);
const FILES_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub(crate) struct RuntimeClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct CommandReply {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: i32,
}

#[derive(Debug, Default, Deserialize)]
struct CodeReply {
    #[serde(default)]
    output: String,
    #[serde(default)]
    error: String,
}

impl RuntimeClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Polls `GET /health` until it answers 200 or `timeout` elapses.
    pub async fn wait_healthy(
        &self,
        name: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<(), SandboxError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let health = self
                .http
                .get(self.url("/health"))
                .timeout(HEALTH_REQUEST_TIMEOUT)
                .send()
                .await;
            match health {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => debug!(sandbox = name, status = %resp.status(), "health check not ready"),
                Err(e) => debug!(sandbox = name, error = %e, "health check failed"),
            }
            if tokio::time::Instant::now() + poll > deadline {
                return Err(SandboxError::readiness_timeout(name, timeout));
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn run_command(&self, command: &str) -> ToolOutput {
        let resp = self
            .http
            .post(self.url("/execute"))
            .json(&json!({ "command": command }))
            .timeout(EXEC_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("sandbox request failed: {e}"))?;
        let reply: CommandReply = parse_reply(resp).await?;
        Ok(format_command_output(&reply.stdout, &reply.stderr, reply.exit_code))
    }

    pub async fn run_code(&self, code: &str) -> ToolOutput {
        let resp = self
            .http
            .post(self.url("/code"))
            .json(&json!({ "code": code }))
            .timeout(EXEC_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("sandbox request failed: {e}"))?;
        let reply: CodeReply = parse_reply(resp).await?;
        Ok(format_code_output(&reply.output, &reply.error))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> ToolOutput {
        let resp = self
            .http
            .post(self.url("/files"))
            .json(&json!({ "path": path, "content": content }))
            .timeout(FILES_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("sandbox request failed: {e}"))?;
        let reply: Value = parse_reply(resp).await?;
        failure(&reply)?;
        inline_failure(field(&reply, "message").unwrap_or("written"))
    }

    pub async fn read_file(&self, path: &str) -> ToolOutput {
        let resp = self
            .http
            .get(self.url("/files"))
            .query(&[("path", path)])
            .timeout(FILES_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("sandbox request failed: {e}"))?;
        let reply: Value = parse_reply(resp).await?;
        failure(&reply)?;
        inline_failure(field(&reply, "content").unwrap_or_default())
    }
}

fn field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// A file reply carrying `error` failed.
fn failure(reply: &Value) -> Result<(), String> {
    match field(reply, "error") {
        Some(error) => Err(error.to_string()),
        None => Ok(()),
    }
}

/// Older runtime images report file failures inline as `[error] <message>`.
fn inline_failure(text: &str) -> ToolOutput {
    match text.strip_prefix("[error] ") {
        Some(message) => Err(message.to_string()),
        None => Ok(text.to_string()),
    }
}

/// Decodes a JSON reply; anything else becomes `[sandbox HTTP <status>] <body>`.
async fn parse_reply<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, String> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| format!("failed to read sandbox response: {e}"))?;
    serde_json::from_str(&text)
        .map_err(|_| format!("[sandbox HTTP {}] {}", status.as_u16(), crate::agent::truncate(&text, 500)))
}

/// Joins command output the way the model sees it.
pub(crate) fn format_command_output(stdout: &str, stderr: &str, exit_code: i32) -> String {
    let mut parts = Vec::new();
    if !stdout.is_empty() {
        parts.push(stdout.to_string());
    }
    if !stderr.is_empty() {
        parts.push(format!("[stderr] {stderr}"));
    }
    if exit_code != 0 {
        parts.push(format!("[exit_code] {exit_code}"));
    }
    or_no_output(parts.join("\n"))
}

/// Joins code interpreter output the way the model sees it.
pub(crate) fn format_code_output(output: &str, error: &str) -> String {
    let mut parts = Vec::new();
    if !output.is_empty() {
        parts.push(output.to_string());
    }
    if !error.is_empty() {
        parts.push(format!("[error] {error}"));
    }
    or_no_output(parts.join("\n"))
}

pub(crate) fn or_no_output(text: String) -> String {
    if text.is_empty() {
        "(no output)".to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::extract::Query;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::BTreeMap;

    #[test]
    fn test_format_command_output() {
        assert_eq!(format_command_output("ok\n", "", 0), "ok\n");
        assert_eq!(
            format_command_output("", "boom", 2),
            "[stderr] boom\n[exit_code] 2"
        );
        assert_eq!(format_command_output("", "", 0), "(no output)");
    }

    #[test]
    fn test_format_code_output() {
        assert_eq!(format_code_output("42\n", ""), "42\n");
        assert_eq!(
            format_code_output("partial", "ZeroDivisionError: division by zero"),
            "partial\n[error] ZeroDivisionError: division by zero"
        );
        assert_eq!(format_code_output("", ""), "(no output)");
    }

    fn stub() -> Router {
        Router::new()
            .route("/health", get(|| async { Json(json!({ "status": "ready" })) }))
            .route(
                "/execute",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({
                        "stdout": format!("ran {}", body["command"].as_str().unwrap_or_default()),
                        "stderr": "",
                        "exit_code": 1,
                    }))
                }),
            )
            .route("/code", post(|| async { "<html>bad gateway</html>" }))
            .route(
                "/files",
                get(|| async { Json(json!({ "content": "file body" })) })
                    .post(|| async { Json(json!({ "message": "Written 3 bytes to /tmp/a" })) }),
            )
    }

    #[tokio::test]
    async fn test_client_round_trips() {
        let base = serve(stub()).await;
        let client = RuntimeClient::new(reqwest::Client::new(), base);

        client
            .wait_healthy("stub", Duration::from_secs(2), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(
            client.run_command("ls").await.unwrap(),
            "ran ls\n[exit_code] 1"
        );
        assert_eq!(
            client.write_file("/tmp/a", "abc").await.unwrap(),
            "Written 3 bytes to /tmp/a"
        );
        assert_eq!(client.read_file("/tmp/a").await.unwrap(), "file body");
    }

    #[tokio::test]
    async fn test_file_failures_are_errors() {
        let router = Router::new().route(
            "/files",
            get(|Query(query): Query<BTreeMap<String, String>>| async move {
                match query["path"].as_str() {
                    "/missing" => Json(json!({ "error": "File not found: /missing" })),
                    _ => Json(json!({ "content": "[error] File not found: /old-runtime" })),
                }
            })
            .post(|| async { Json(json!({ "message": "[error] Cannot write to /etc/passwd" })) }),
        );
        let base = serve(router).await;
        let client = RuntimeClient::new(reqwest::Client::new(), base);

        assert_eq!(
            client.read_file("/missing").await,
            Err("File not found: /missing".to_string())
        );
        assert_eq!(
            client.read_file("/old").await,
            Err("File not found: /old-runtime".to_string())
        );
        assert_eq!(
            client.write_file("/etc/passwd", "x").await,
            Err("Cannot write to /etc/passwd".to_string())
        );
    }

    #[tokio::test]
    async fn test_non_json_reply_is_reported() {
        let base = serve(stub()).await;
        let client = RuntimeClient::new(reqwest::Client::new(), base);
        let err = client.run_code("print(1)").await.unwrap_err();
        assert_eq!(err, "[sandbox HTTP 200] <html>bad gateway</html>");
    }

    #[tokio::test]
    async fn test_unreachable_runtime_times_out() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = RuntimeClient::new(reqwest::Client::new(), format!("http://127.0.0.1:{port}"));
        let started = std::time::Instant::now();
        let err = client
            .wait_healthy("sandbox-dead", Duration::from_millis(600), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(client.run_command("ls").await.is_err());
    }
}
