//! Sandbox configuration types
//!
//! Configuration for the execution sandboxes (container and local process)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: BackendPreference,
    /// Container configuration
    #[serde(default)]
    pub container: ContainerConfig,
    /// Local process configuration
    #[serde(default)]
    pub local: LocalConfig,
    /// Wall-clock limit per run in seconds, 0 disables it
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    /// Maximum program output forwarded per run
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    /// How often a container exec is polled for completion
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How long trailing output is awaited after exit
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
    /// Well-known result files surfaced after every run
    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            backend: BackendPreference::default(),
            container: ContainerConfig::default(),
            local: LocalConfig::default(),
            default_timeout_secs: default_timeout(),
            max_output_bytes: default_max_output(),
            poll_interval_ms: default_poll_interval(),
            drain_timeout_ms: default_drain_timeout(),
            artifacts: default_artifacts(),
        }
    }
}

impl SandboxConfig {
    /// Run timeout, `None` when disabled
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_output() -> usize {
    1024 * 1024 // 1MB
}

fn default_poll_interval() -> u64 {
    250
}

fn default_drain_timeout() -> u64 {
    2000
}

fn default_artifacts() -> Vec<String> {
    [
        "output.png",
        "output.jpg",
        "output.gif",
        "output.svg",
        "output.html",
        "output.json",
        "output.txt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Container when the runtime answers, local otherwise
    #[default]
    Auto,
    /// Container only; startup fails without a runtime
    Container,
    /// Local processes only
    Local,
}

impl std::str::FromStr for BackendPreference {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "container" | "docker" => Ok(BackendPreference::Container),
            "local" | "process" | "os" => Ok(BackendPreference::Local),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid backend: {}. Valid: auto, container, local",
                s
            ))),
        }
    }
}

impl std::fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendPreference::Auto => write!(f, "auto"),
            BackendPreference::Container => write!(f, "container"),
            BackendPreference::Local => write!(f, "local"),
        }
    }
}

/// Network access granted to containers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// No network at all
    #[default]
    None,
    /// Default bridge, needed when runs install dependencies
    Bridge,
}

impl NetworkPolicy {
    /// Docker `NetworkMode` value
    pub fn network_mode(&self) -> &'static str {
        match self {
            NetworkPolicy::None => "none",
            NetworkPolicy::Bridge => "bridge",
        }
    }
}

impl std::str::FromStr for NetworkPolicy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(NetworkPolicy::None),
            "bridge" => Ok(NetworkPolicy::Bridge),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid network policy: {}. Valid: none, bridge",
                s
            ))),
        }
    }
}

/// Container (Docker) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Network policy
    #[serde(default)]
    pub network: NetworkPolicy,
    /// Memory limit
    #[serde(default = "default_memory")]
    pub memory_limit: String,
    /// CPU share as a fraction of one CPU
    #[serde(default = "default_cpu")]
    pub cpu_limit: f64,
    /// CFS period in microseconds
    #[serde(default = "default_cpu_period")]
    pub cpu_period: i64,
    /// Maximum number of processes
    #[serde(default = "default_pids")]
    pub pids_limit: i64,
    /// Workspace directory inside the container
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Images clients may request; empty allows any
    #[serde(default)]
    pub allowed_images: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Image pull timeout
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,
    /// Foreground process that keeps the container alive between runs
    #[serde(default = "default_keepalive")]
    pub keepalive: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            network: NetworkPolicy::default(),
            memory_limit: default_memory(),
            cpu_limit: default_cpu(),
            cpu_period: default_cpu_period(),
            pids_limit: default_pids(),
            workdir: default_workdir(),
            allowed_images: Vec::new(),
            env: HashMap::new(),
            pull_timeout_secs: default_pull_timeout(),
            keepalive: default_keepalive(),
        }
    }
}

impl ContainerConfig {
    /// Memory limit in bytes
    pub fn memory_bytes(&self) -> Option<i64> {
        parse_memory_limit(&self.memory_limit)
    }

    /// CFS quota matching `cpu_limit`
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period as f64 * self.cpu_limit).round() as i64
    }

    /// Whether a client may request `image`
    pub fn image_allowed(&self, image: &str) -> bool {
        self.allowed_images.is_empty() || self.allowed_images.iter().any(|i| i == image)
    }
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpu() -> f64 {
    0.5
}

fn default_cpu_period() -> i64 {
    100_000
}

fn default_pids() -> i64 {
    256
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_pull_timeout() -> u64 {
    600
}

fn default_keepalive() -> Vec<String> {
    vec!["tail".into(), "-f".into(), "/dev/null".into()]
}

/// Local process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Environment overrides forcing headless behaviour
    #[serde(default = "default_local_env")]
    pub env: HashMap<String, String>,
    /// Stream the diagnostic preamble to the client before every run
    #[serde(default)]
    pub emit_preamble: bool,
    /// Parent of the per-session scratch directories (host temp dir if unset)
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            env: default_local_env(),
            emit_preamble: false,
            temp_root: None,
        }
    }
}

fn default_local_env() -> HashMap<String, String> {
    HashMap::from([
        ("MPLBACKEND".to_string(), "Agg".to_string()),
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
    ])
}

/// Parse a memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, unit) = if limit.ends_with("gb") || limit.ends_with('g') {
        (limit.trim_end_matches(['g', 'b']), 1024 * 1024 * 1024)
    } else if limit.ends_with("mb") || limit.ends_with('m') {
        (limit.trim_end_matches(['m', 'b']), 1024 * 1024)
    } else if limit.ends_with("kb") || limit.ends_with('k') {
        (limit.trim_end_matches(['k', 'b']), 1024)
    } else {
        (limit.trim_end_matches('b'), 1)
    };

    let num: i64 = num_str.parse().ok()?;
    (num > 0).then_some(num * unit)
}
