use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "agentura.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub worker_server: WorkerServerConfig,
}

// -----------------------------------------------------------------------------
// Backend selection
// -----------------------------------------------------------------------------

/// Where sandboxes come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Local Docker daemon.
    #[default]
    #[serde(rename = "docker")]
    Docker,
    /// Ephemeral pods in a Kubernetes namespace.
    #[serde(rename = "k8s", alias = "kubernetes")]
    Kubernetes,
    /// Third-party code-interpreter service.
    #[serde(rename = "cloud", alias = "e2b")]
    Cloud,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Kubernetes => write!(f, "k8s"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "k8s" | "kubernetes" => Ok(Self::Kubernetes),
            "cloud" | "e2b" => Ok(Self::Cloud),
            _ => anyhow::bail!("Unknown sandbox backend: '{s}'. Supported: docker, k8s, cloud"),
        }
    }
}

/// How the Kubernetes backend talks to its pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcMode {
    /// HTTP to the pod IP.
    #[default]
    Http,
    /// Request/response files dropped through `kubectl exec`.
    File,
}

impl std::fmt::Display for IpcMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::File => write!(f, "file"),
        }
    }
}

impl std::str::FromStr for IpcMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "file" => Ok(Self::File),
            _ => anyhow::bail!("Unknown IPC mode: '{s}'. Supported: http, file"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub ipc_mode: IpcMode,
}

// -----------------------------------------------------------------------------
// Backends
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Image that serves the sandbox runtime on port 8080
    #[serde(default = "default_runtime_image")]
    pub image: String,

    /// Daemon endpoint such as `tcp://10.0.0.2:2375` or `unix:///run/docker.sock`.
    /// Falls back to `DOCKER_HOST`, the local socket, then the docker context.
    #[serde(default)]
    pub host: Option<String>,

    /// Seconds allowed for connecting, creating, starting and `/health`
    #[serde(default = "default_docker_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Health poll interval in milliseconds
    #[serde(default = "default_health_poll_ms")]
    pub health_poll_ms: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_runtime_image(),
            host: None,
            ready_timeout_secs: default_docker_ready_timeout(),
            health_poll_ms: default_health_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Sandbox runtime image
    #[serde(default = "default_runtime_image")]
    pub image: String,

    /// Optional runtime class (e.g. "gvisor")
    #[serde(default)]
    pub runtime_class: Option<String>,

    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,

    /// Seconds to wait for the pod to report Ready
    #[serde(default = "default_pod_ready_timeout")]
    pub pod_ready_timeout_secs: u64,

    /// Pod status poll interval in milliseconds
    #[serde(default = "default_pod_poll_ms")]
    pub poll_interval_ms: u64,

    /// Path to the kubectl binary
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    /// Per-request API server timeout passed to kubectl (0 disables it)
    #[serde(default = "default_kubectl_request_timeout")]
    pub request_timeout_secs: u64,

    /// Kubeconfig context (uses the current context if unset)
    #[serde(default)]
    pub context: Option<String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            image: default_runtime_image(),
            runtime_class: None,
            image_pull_policy: default_pull_policy(),
            pod_ready_timeout_secs: default_pod_ready_timeout(),
            poll_interval_ms: default_pod_poll_ms(),
            kubectl: default_kubectl(),
            request_timeout_secs: default_kubectl_request_timeout(),
            context: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_cloud_api_url")]
    pub api_url: String,

    /// Domain under which sandbox ports are exposed as `<port>-<id>.<domain>`
    #[serde(default = "default_cloud_domain")]
    pub domain: String,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_url: default_cloud_api_url(),
            domain: default_cloud_domain(),
            api_key: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Worker pods
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub image: String,
    pub cpu: String,
    pub memory: String,
    /// Wall-clock bound for the whole streamed exchange
    pub timeout_secs: u64,
    /// Turn budget when the skill does not set one
    pub default_max_turns: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_full_worker")]
    pub full: WorkerConfig,

    #[serde(default = "default_lightweight_worker")]
    pub lightweight: WorkerConfig,

    /// Port the worker serves `/execute-stream` on
    #[serde(default = "default_service_port")]
    pub port: u16,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            full: default_full_worker(),
            lightweight: default_lightweight_worker(),
            port: default_service_port(),
        }
    }
}

fn default_full_worker() -> WorkerConfig {
    WorkerConfig {
        image: "agentura/claude-code-worker:latest".to_string(),
        cpu: "2".to_string(),
        memory: "2048Mi".to_string(),
        timeout_secs: 600,
        default_max_turns: 25,
    }
}

fn default_lightweight_worker() -> WorkerConfig {
    WorkerConfig {
        image: "agentura/ptc-worker:latest".to_string(),
        cpu: "1".to_string(),
        memory: "512Mi".to_string(),
        timeout_secs: 300,
        default_max_turns: 15,
    }
}

// -----------------------------------------------------------------------------
// Model providers
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Preferred provider key (OpenAI-compatible router)
    #[serde(default)]
    pub openrouter_api_key: Option<String>,

    /// Native Anthropic key, used when no router key is set
    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    #[serde(default = "default_openrouter_base")]
    pub openrouter_base_url: String,

    #[serde(default = "default_anthropic_base")]
    pub anthropic_base_url: String,

    /// Sent as `HTTP-Referer` to the router
    #[serde(default = "default_referer")]
    pub referer: String,

    /// Sent as `X-Title` to the router
    #[serde(default = "default_title")]
    pub title: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Extra short-name aliases merged over the built-in table
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            anthropic_api_key: None,
            openrouter_base_url: default_openrouter_base(),
            anthropic_base_url: default_anthropic_base(),
            referer: default_referer(),
            title: default_title(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            timeout_secs: default_llm_timeout(),
            aliases: BTreeMap::new(),
        }
    }
}

/// Per-million-token rates in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_rate")]
    pub default: ModelRate,

    /// Overrides keyed by resolved model id
    #[serde(default)]
    pub models: BTreeMap<String, ModelRate>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default: default_rate(),
            models: BTreeMap::new(),
        }
    }
}

impl PricingConfig {
    /// Rate for a model, falling back to the default rate.
    pub fn rate_for(&self, model: &str) -> ModelRate {
        self.models.get(model).copied().unwrap_or(self.default)
    }

    /// Cost in USD for a token count.
    pub fn cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        let rate = self.rate_for(model);
        #[allow(clippy::cast_precision_loss)]
        let cost = (tokens_in as f64 * rate.input + tokens_out as f64 * rate.output) / 1_000_000.0;
        cost
    }
}

// -----------------------------------------------------------------------------
// Agent loop
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Characters of tool output kept in the iteration log
    #[serde(default = "default_iteration_limit")]
    pub iteration_output_limit: usize,

    /// Characters of tool output fed back to the model
    #[serde(default = "default_conversation_limit")]
    pub conversation_output_limit: usize,

    /// Host directory receiving extracted artifacts
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,

    /// Seconds allowed for reading artifacts back out of the sandbox
    #[serde(default = "default_artifact_timeout")]
    pub artifact_timeout_secs: u64,

    /// Capacity of the streaming event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            iteration_output_limit: default_iteration_limit(),
            conversation_output_limit: default_conversation_limit(),
            artifacts_dir: default_artifacts_dir(),
            artifact_timeout_secs: default_artifact_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Directory holding `requests/` and `responses/`
    #[serde(default = "default_ipc_root")]
    pub root: PathBuf,

    #[serde(default = "default_ipc_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_ipc_timeout")]
    pub timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            root: default_ipc_root(),
            poll_interval_ms: default_ipc_poll_ms(),
            timeout_secs: default_ipc_timeout(),
        }
    }
}

// -----------------------------------------------------------------------------
// Servers
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Working directory for shell commands
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Roots that `POST /files` may write under
    #[serde(default = "default_writable_roots")]
    pub writable_roots: Vec<PathBuf>,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Interpreter used for `POST /code`
    #[serde(default = "default_python")]
    pub python: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workdir: default_workdir(),
            writable_roots: default_writable_roots(),
            command_timeout_secs: default_command_timeout(),
            python: default_python(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_mcp_call_timeout")]
    pub mcp_call_timeout_secs: u64,

    #[serde(default = "default_mcp_fetch_timeout")]
    pub mcp_fetch_timeout_secs: u64,

    /// Workspace the built-in file and shell tools operate in
    #[serde(default = "default_worker_workdir")]
    pub workdir: PathBuf,

    /// Timeout for one `Bash` tool call
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for WorkerServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            mcp_call_timeout_secs: default_mcp_call_timeout(),
            mcp_fetch_timeout_secs: default_mcp_fetch_timeout(),
            workdir: default_worker_workdir(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

// Default value functions
fn default_runtime_image() -> String {
    "agentura/sandbox-runtime:latest".to_string()
}

fn default_docker_ready_timeout() -> u64 {
    30
}

fn default_health_poll_ms() -> u64 {
    500
}

fn default_namespace() -> String {
    "agentura".to_string()
}

fn default_pull_policy() -> String {
    "Never".to_string()
}

fn default_pod_ready_timeout() -> u64 {
    120
}

fn default_pod_poll_ms() -> u64 {
    1000
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_kubectl_request_timeout() -> u64 {
    30
}

fn default_cloud_api_url() -> String {
    "https://api.e2b.dev".to_string()
}

fn default_cloud_domain() -> String {
    "e2b.app".to_string()
}

fn default_service_port() -> u16 {
    8080
}

fn default_openrouter_base() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_anthropic_base() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_referer() -> String {
    "https://agentura.dev".to_string()
}

fn default_title() -> String {
    "Agentura".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_rate() -> ModelRate {
    ModelRate {
        input: 3.0,
        output: 15.0,
    }
}

fn default_iteration_limit() -> usize {
    2000
}

fn default_conversation_limit() -> usize {
    4000
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("/artifacts")
}

fn default_artifact_timeout() -> u64 {
    60
}

fn default_event_buffer() -> usize {
    32
}

fn default_ipc_root() -> PathBuf {
    PathBuf::from("/ipc")
}

fn default_ipc_poll_ms() -> u64 {
    100
}

fn default_ipc_timeout() -> u64 {
    30
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/home/sandbox")
}

fn default_worker_workdir() -> PathBuf {
    PathBuf::from("/home/worker/workspace")
}

fn default_writable_roots() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/home/sandbox"),
        PathBuf::from("/home/user"),
        PathBuf::from("/tmp"),
    ]
}

fn default_command_timeout() -> u64 {
    120
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_mcp_call_timeout() -> u64 {
    60
}

fn default_mcp_fetch_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration, then apply environment overrides.
    ///
    /// An explicit path must exist. Without one, `agentura.toml` in the
    /// current directory is tried, then `<config dir>/agentura/config.toml`,
    /// then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::discover() {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        let global = dirs::config_dir()?.join("agentura").join("config.toml");
        global.exists().then_some(global)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = get("SANDBOX_BACKEND").and_then(|v| v.parse().ok()) {
            self.sandbox.backend = backend;
        }
        if let Some(mode) = get("SANDBOX_IPC_MODE").and_then(|v| v.parse().ok()) {
            self.sandbox.ipc_mode = mode;
        }
        if let Some(ns) = get("SANDBOX_NAMESPACE") {
            self.kubernetes.namespace = ns;
        }
        if let Some(image) = get("SANDBOX_IMAGE") {
            self.kubernetes.image.clone_from(&image);
            self.docker.image = image;
        }
        if let Some(class) = get("SANDBOX_RUNTIME_CLASS") {
            self.kubernetes.runtime_class = Some(class);
        }
        if let Some(policy) = get("SANDBOX_IMAGE_PULL_POLICY") {
            self.kubernetes.image_pull_policy = policy;
        }

        apply_worker_env(&mut self.workers.full, "CLAUDE_CODE_WORKER", &get);
        apply_worker_env(&mut self.workers.lightweight, "PTC_WORKER", &get);

        if let Some(dir) = get("ARTIFACTS_DIR") {
            self.agent.artifacts_dir = PathBuf::from(dir);
        }
        if let Some(key) = get("OPENROUTER_API_KEY") {
            self.llm.openrouter_api_key = Some(key);
        }
        if let Some(key) = get("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(key);
        }
        if let Some(referer) = get("OPENROUTER_REFERER") {
            self.llm.referer = referer;
        }
        if let Some(key) = get("E2B_API_KEY") {
            self.cloud.api_key = Some(key);
        }
        if let Some(secs) = get("MCP_CALL_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.worker_server.mcp_call_timeout_secs = secs;
        }
        if let Some(secs) = get("MCP_FETCH_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.worker_server.mcp_fetch_timeout_secs = secs;
        }
        if let Some(dir) = get("WORK_DIR") {
            self.worker_server.workdir = PathBuf::from(dir);
        }
    }

    /// Environment handed to worker pods so they can reach the model providers.
    pub fn worker_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(key) = &self.llm.anthropic_api_key {
            env.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
        }
        if let Some(key) = &self.llm.openrouter_api_key {
            env.insert("OPENROUTER_API_KEY".to_string(), key.clone());
        }
        env
    }
}

fn apply_worker_env(worker: &mut WorkerConfig, prefix: &str, get: &impl Fn(&str) -> Option<String>) {
    if let Some(image) = get(&format!("{prefix}_IMAGE")) {
        worker.image = image;
    }
    if let Some(cpu) = get(&format!("{prefix}_CPU")) {
        worker.cpu = cpu;
    }
    if let Some(memory) = get(&format!("{prefix}_MEMORY")) {
        worker.memory = memory;
    }
    if let Some(secs) = get(&format!("{prefix}_TIMEOUT")).and_then(|v| v.parse().ok()) {
        worker.timeout_secs = secs;
    }
}
