//! Hosted code-interpreter sandboxes (E2B REST API).
//!
//! The control plane lives at `api_url`; each sandbox exposes its code
//! interpreter on port 49999 and its filesystem daemon on port 49983 at
//! `https://<port>-<sandbox id>.<domain>`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::runtime_client::or_no_output;
use super::{Sandbox, SandboxBackend, SandboxError, ToolOutput};
use crate::config::CloudConfig;
use crate::types::SandboxConfig;

const INTERPRETER_PORT: u16 = 49999;
const FILES_PORT: u16 = 49983;
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);
const FILES_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct CloudBackend {
    config: CloudConfig,
    api_key: String,
    http: reqwest::Client,
}

impl CloudBackend {
    pub fn new(config: CloudConfig, api_key: String, http: reqwest::Client) -> Self {
        Self {
            config,
            api_key,
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSandbox {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    envd_access_token: Option<String>,
}

#[async_trait]
impl SandboxBackend for CloudBackend {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn create(
        &self,
        config: &SandboxConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        let api_url = self.config.api_url.trim_end_matches('/');
        let resp = self
            .http
            .post(format!("{api_url}/sandboxes"))
            .header("X-API-Key", &self.api_key)
            .json(&json!({
                "templateID": config.template,
                "timeout": config.timeout,
                "envVars": env,
            }))
            .timeout(CREATE_TIMEOUT)
            .send()
            .await
            .map_err(|e| SandboxError::cloud_api(format!("create request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| SandboxError::cloud_api(format!("create response unreadable: {e}")))?;
        if !status.is_success() {
            return Err(SandboxError::cloud_api(format!(
                "create returned {}: {}",
                status.as_u16(),
                crate::agent::truncate(&body, 300)
            )));
        }
        let created: CreatedSandbox = serde_json::from_str(&body)
            .map_err(|e| SandboxError::cloud_api(format!("unexpected create response: {e}")))?;

        let domain = created
            .domain
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| self.config.domain.clone());
        info!(event = "sandbox_created", backend = "cloud", sandbox = %created.sandbox_id, template = %config.template);

        Ok(Box::new(CloudSandbox {
            http: self.http.clone(),
            api_url: api_url.to_string(),
            api_key: self.api_key.clone(),
            interpreter_url: port_url(INTERPRETER_PORT, &created.sandbox_id, &domain),
            files_url: port_url(FILES_PORT, &created.sandbox_id, &domain),
            access_token: created.envd_access_token,
            id: created.sandbox_id,
        }))
    }
}

fn port_url(port: u16, sandbox_id: &str, domain: &str) -> String {
    format!("https://{port}-{sandbox_id}.{domain}")
}

struct CloudSandbox {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    interpreter_url: String,
    files_url: String,
    access_token: Option<String>,
    id: String,
}

impl CloudSandbox {
    fn with_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.header("X-Access-Token", token),
            None => request,
        }
    }

    async fn execute(&self, code: &str, language: &str) -> Result<Execution, String> {
        let resp = self
            .with_token(self.http.post(format!("{}/execute", self.interpreter_url)))
            .json(&json!({ "code": code, "language": language }))
            .timeout(EXEC_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("sandbox request failed: {e}"))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| format!("failed to read sandbox response: {e}"))?;
        if !status.is_success() {
            return Err(format!(
                "[sandbox HTTP {}] {}",
                status.as_u16(),
                crate::agent::truncate(&body, 500)
            ));
        }
        Ok(Execution::from_ndjson(&body))
    }
}

#[async_trait]
impl Sandbox for CloudSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_code(&self, code: &str) -> ToolOutput {
        Ok(self.execute(code, "python").await?.render_code())
    }

    async fn run_command(&self, command: &str) -> ToolOutput {
        Ok(self.execute(command, "bash").await?.render_command())
    }

    async fn write_file(&self, path: &str, content: &str) -> ToolOutput {
        let part = reqwest::multipart::Part::text(content.to_string()).file_name(
            path.rsplit('/').next().unwrap_or("file").to_string(),
        );
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .with_token(self.http.post(format!("{}/files", self.files_url)))
            .query(&[("path", path), ("username", "user")])
            .multipart(form)
            .timeout(FILES_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("sandbox request failed: {e}"))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("[sandbox HTTP {status}] {}", crate::agent::truncate(&body, 500)));
        }
        Ok(format!("Written {} bytes to {path}", content.len()))
    }

    async fn read_file(&self, path: &str) -> ToolOutput {
        let resp = self
            .with_token(self.http.get(format!("{}/files", self.files_url)))
            .query(&[("path", path), ("username", "user")])
            .timeout(FILES_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("sandbox request failed: {e}"))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| format!("failed to read sandbox response: {e}"))?;
        match status.as_u16() {
            200..=299 => Ok(body),
            404 => Err(format!("File not found: {path}")),
            code => Err(format!("[sandbox HTTP {code}] {}", crate::agent::truncate(&body, 500))),
        }
    }

    async fn close(&self) {
        let result = self
            .http
            .delete(format!("{}/sandboxes/{}", self.api_url, self.id))
            .header("X-API-Key", &self.api_key)
            .timeout(FILES_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 404 => {
                info!(event = "sandbox_closed", backend = "cloud", sandbox = %self.id);
            }
            Ok(resp) => warn!("Failed to kill cloud sandbox {}: HTTP {}", self.id, resp.status()),
            Err(e) => warn!("Failed to kill cloud sandbox {}: {}", self.id, e),
        }
    }
}

/// Output of one interpreter execution, collected from its NDJSON stream.
#[derive(Debug, Default, PartialEq)]
struct Execution {
    results: Vec<String>,
    stdout: String,
    stderr: String,
    error: Option<String>,
}

impl Execution {
    fn from_ndjson(body: &str) -> Self {
        let mut execution = Self::default();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(event) = serde_json::from_str::<Value>(line) else {
                debug!("skipping non-JSON interpreter line");
                continue;
            };
            let text = event["text"].as_str().unwrap_or_default();
            match event["type"].as_str().unwrap_or_default() {
                "stdout" => execution.stdout.push_str(text),
                "stderr" => execution.stderr.push_str(text),
                "result" if !text.is_empty() => execution.results.push(text.to_string()),
                "error" => {
                    execution.error = Some(format!(
                        "{}: {}",
                        event["name"].as_str().unwrap_or("Error"),
                        event["value"].as_str().unwrap_or_default()
                    ));
                }
                _ => {}
            }
        }
        execution
    }

    fn render_code(mut self) -> String {
        let mut parts = std::mem::take(&mut self.results);
        parts.extend(self.streams());
        or_no_output(parts.join("\n"))
    }

    /// Shell commands produce no rich results.
    fn render_command(self) -> String {
        or_no_output(self.streams().join("\n"))
    }

    fn streams(self) -> Vec<String> {
        let mut parts = Vec::new();
        if !self.stdout.is_empty() {
            parts.push(self.stdout);
        }
        if !self.stderr.is_empty() {
            parts.push(format!("[stderr] {}", self.stderr));
        }
        if let Some(error) = self.error {
            parts.push(format!("[error] {error}"));
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_execution_stream() {
        let body = concat!(
            r#"{"type":"stdout","text":"hello\n","timestamp":1}"#, "\n",
            r#"{"type":"result","text":"42","is_main_result":true}"#, "\n",
            r#"{"type":"stderr","text":"warn\n"}"#, "\n",
            r#"{"type":"end_of_execution"}"#, "\n",
        );
        let execution = Execution::from_ndjson(body);
        assert_eq!(execution.results, vec!["42".to_string()]);
        assert_eq!(execution.render_code(), "42\nhello\n\n[stderr] warn\n");
    }

    #[test]
    fn test_parse_execution_error() {
        let body = r#"{"type":"error","name":"ZeroDivisionError","value":"division by zero","traceback":"..."}"#;
        assert_eq!(
            Execution::from_ndjson(body).render_code(),
            "[error] ZeroDivisionError: division by zero"
        );
        assert_eq!(Execution::from_ndjson("").render_command(), "(no output)");
    }

    #[test]
    fn test_port_url() {
        assert_eq!(port_url(49999, "i1abc", "e2b.app"), "https://49999-i1abc.e2b.app");
    }

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<String>>>);

    #[tokio::test]
    async fn test_create_and_kill() {
        let calls = Calls::default();
        let router = Router::new()
            .route(
                "/sandboxes",
                post(|State(calls): State<Calls>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    calls.0.lock().unwrap().push(format!(
                        "create {} {} key={}",
                        body["templateID"].as_str().unwrap_or_default(),
                        body["envVars"]["TOKEN"].as_str().unwrap_or_default(),
                        headers.get("x-api-key").and_then(|v| v.to_str().ok()).unwrap_or_default(),
                    ));
                    (StatusCode::CREATED, Json(json!({ "sandboxID": "sbx1", "clientID": "c" })))
                }),
            )
            .route(
                "/sandboxes/{id}",
                delete(|State(calls): State<Calls>, Path(id): Path<String>| async move {
                    calls.0.lock().unwrap().push(format!("kill {id}"));
                    StatusCode::NO_CONTENT
                }),
            )
            .with_state(calls.clone());
        let base = serve(router).await;

        let backend = CloudBackend::new(
            CloudConfig {
                api_url: base,
                ..CloudConfig::default()
            },
            "e2b_test".to_string(),
            reqwest::Client::new(),
        );
        let mut env = BTreeMap::new();
        env.insert("TOKEN".to_string(), "t".to_string());
        let sandbox = backend.create(&SandboxConfig::default(), &env).await.unwrap();
        assert_eq!(sandbox.id(), "sbx1");
        sandbox.close().await;

        assert_eq!(
            *calls.0.lock().unwrap(),
            vec!["create base t key=e2b_test".to_string(), "kill sbx1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_create_rejected() {
        let router = Router::new().route(
            "/sandboxes",
            post(|| async { (StatusCode::UNAUTHORIZED, "invalid api key") }),
        );
        let base = serve(router).await;
        let backend = CloudBackend::new(
            CloudConfig {
                api_url: base,
                ..CloudConfig::default()
            },
            "bad".to_string(),
            reqwest::Client::new(),
        );
        let err = backend
            .create(&SandboxConfig::default(), &BTreeMap::new())
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Cloud sandbox API error: create returned 401: invalid api key"
        );
    }
}
