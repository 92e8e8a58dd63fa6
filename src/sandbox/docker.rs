use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions,
};
use bollard::service::{HostConfig, PortBinding, PortMap};
use bollard::Docker;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{sandbox_name, RuntimeClient, Sandbox, SandboxBackend, SandboxError, ToolOutput};
use crate::config::DockerConfig;
use crate::types::SandboxConfig;

const CONTAINER_PORT: &str = "8080/tcp";
const CONTEXT_INSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT_SECS: u64 = 120;
const REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the sandbox runtime image in a local container.
pub(crate) struct DockerBackend {
    config: DockerConfig,
    http: reqwest::Client,
}

impl DockerBackend {
    pub fn new(config: DockerConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn build_container_config(
        &self,
        sandbox: &SandboxConfig,
        env: &BTreeMap<String, String>,
    ) -> ContainerConfig<String> {
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(CONTAINER_PORT.to_string(), HashMap::new());

        // Empty host port asks the daemon for an ephemeral one.
        let mut port_bindings: PortMap = HashMap::new();
        port_bindings.insert(
            CONTAINER_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(String::new()),
            }]),
        );

        ContainerConfig {
            image: Some(self.config.image.clone()),
            env: Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                memory: Some(i64::from(sandbox.memory) * 1024 * 1024),
                nano_cpus: Some(i64::from(sandbox.cpu) * 1_000_000_000),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    /// Connecting, creating, starting and health-checking all share one
    /// `ready_timeout_secs` deadline. The container is force-removed when
    /// any step fails or the deadline passes.
    async fn create(
        &self,
        config: &SandboxConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        let timeout = Duration::from_secs(self.config.ready_timeout_secs);
        let deadline = tokio::time::Instant::now() + timeout;

        let docker = tokio::time::timeout_at(deadline, connect(self.config.host.as_deref()))
            .await
            .map_err(|_| {
                SandboxError::docker_unavailable(format!(
                    "Docker daemon did not answer within {}s",
                    timeout.as_secs()
                ))
            })??;

        let name = sandbox_name("sandbox");
        let provisioned = tokio::time::timeout_at(deadline, self.provision(&docker, &name, config, env))
            .await
            .unwrap_or_else(|_| Err(SandboxError::readiness_timeout(&name, timeout)));

        match provisioned {
            Ok((host_port, client)) => {
                info!(event = "sandbox_created", backend = "docker", container = %name, host_port);
                Ok(Box::new(DockerSandbox {
                    docker,
                    name,
                    client,
                }))
            }
            Err(e) => {
                remove(&docker, &name).await;
                Err(e)
            }
        }
    }
}

impl DockerBackend {
    async fn provision(
        &self,
        docker: &Docker,
        name: &str,
        config: &SandboxConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<(u16, RuntimeClient), SandboxError> {
        debug!("Creating container: {}", name);
        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                self.build_container_config(config, env),
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::image_not_found(&self.config.image),
                other => SandboxError::container_failed(format!("create {name}: {other}")),
            })?;

        docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| SandboxError::container_failed(format!("start {name}: {e}")))?;

        let inspect = docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::container_failed(format!("inspect {name}: {e}")))?;
        let host_port = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .as_ref()
            .and_then(published_port)
            .ok_or_else(|| SandboxError::container_failed(format!("{name} has no published port")))?;

        let client = RuntimeClient::new(self.http.clone(), format!("http://localhost:{host_port}"));
        client
            .wait_healthy(
                name,
                Duration::from_secs(self.config.ready_timeout_secs),
                Duration::from_millis(self.config.health_poll_ms),
            )
            .await?;
        Ok((host_port, client))
    }
}

struct DockerSandbox {
    docker: Docker,
    name: String,
    client: RuntimeClient,
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.name
    }

    async fn run_code(&self, code: &str) -> ToolOutput {
        self.client.run_code(code).await
    }

    async fn run_command(&self, command: &str) -> ToolOutput {
        self.client.run_command(command).await
    }

    async fn write_file(&self, path: &str, content: &str) -> ToolOutput {
        self.client.write_file(path, content).await
    }

    async fn read_file(&self, path: &str) -> ToolOutput {
        self.client.read_file(path).await
    }

    async fn close(&self) {
        remove(&self.docker, &self.name).await;
        info!(event = "sandbox_closed", backend = "docker", container = %self.name);
    }
}

/// Force-removes a container. A container that was never created is not
/// an error.
async fn remove(docker: &Docker, name: &str) {
    let removal = docker.remove_container(
        name,
        Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        }),
    );
    match tokio::time::timeout(REMOVE_TIMEOUT, removal).await {
        Ok(Ok(())) => {}
        Ok(Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. })) => {
            debug!("Container {} already gone", name);
        }
        Ok(Err(e)) => warn!("Failed to remove container {}: {}", name, e),
        Err(_) => warn!("Timed out removing container {}", name),
    }
}

// -----------------------------------------------------------------------------
// Endpoint resolution
// -----------------------------------------------------------------------------

/// Finds a reachable Docker daemon.
///
/// A configured `host` wins, then `DOCKER_HOST`. Otherwise the platform
/// default socket is pinged, and if that fails the active `docker context`
/// endpoint is used (OrbStack, Colima and friends live there).
async fn connect(host: Option<&str>) -> Result<Docker, SandboxError> {
    if let Some(host) = host {
        return ping(connect_to(host)?).await;
    }
    if std::env::var_os("DOCKER_HOST").is_some() {
        let docker = Docker::connect_with_defaults()
            .map_err(|e| SandboxError::docker_unavailable(format!("DOCKER_HOST: {e}")))?;
        return ping(docker).await;
    }

    let local = Docker::connect_with_local_defaults()
        .map_err(|e| SandboxError::docker_unavailable(e.to_string()));
    let local_error = match local {
        Ok(docker) => match ping(docker).await {
            Ok(docker) => return Ok(docker),
            Err(e) => e,
        },
        Err(e) => e,
    };

    match context_host().await {
        Some(host) => {
            debug!("Default Docker socket unreachable, using context endpoint {}", host);
            ping(connect_to(&host)?).await
        }
        None => Err(local_error),
    }
}

async fn ping(docker: Docker) -> Result<Docker, SandboxError> {
    docker
        .ping()
        .await
        .map_err(|e| SandboxError::docker_unavailable(format!("Cannot ping Docker daemon: {e}")))?;
    Ok(docker)
}

fn connect_to(host: &str) -> Result<Docker, SandboxError> {
    let result = if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
    } else {
        let addr = host.replacen("tcp://", "http://", 1);
        Docker::connect_with_http(&addr, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
    };
    result.map_err(|e| SandboxError::docker_unavailable(format!("{host}: {e}")))
}

async fn context_host() -> Option<String> {
    let output = tokio::time::timeout(
        CONTEXT_INSPECT_TIMEOUT,
        tokio::process::Command::new("docker")
            .args(["context", "inspect", "--format", "json"])
            .stderr(std::process::Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    parse_context_host(&String::from_utf8_lossy(&output.stdout))
}

#[derive(Debug, Deserialize)]
struct DockerContext {
    #[serde(rename = "Endpoints", default)]
    endpoints: HashMap<String, ContextEndpoint>,
}

#[derive(Debug, Deserialize)]
struct ContextEndpoint {
    #[serde(rename = "Host", default)]
    host: String,
}

/// Extracts the docker endpoint host from `docker context inspect` JSON.
fn parse_context_host(json: &str) -> Option<String> {
    let contexts: Vec<DockerContext> = serde_json::from_str(json).ok()?;
    let host = contexts.into_iter().next()?.endpoints.remove("docker")?.host;
    (!host.is_empty()).then_some(host)
}

/// Host port published for the runtime's container port.
fn published_port(ports: &PortMap) -> Option<u16> {
    ports
        .get(CONTAINER_PORT)?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
}
