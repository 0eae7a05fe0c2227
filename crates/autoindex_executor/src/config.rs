//! Executor configuration.
//!
//! Loaded from a TOML file; every key has a default, so an empty file is a
//! valid docker configuration.

use autoindex_protocol::defaults::{
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_MAX_RETRIES, DEFAULT_STATE_STORE_URL,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::{ExecutorError, Result};
use crate::workspace::FetchPolicy;

pub const DEFAULT_IGNITE_VERSION: &str = "v0.10.4";
pub const DEFAULT_FIRECRACKER_KERNEL_IMAGE: &str = "sourcegraph/ignite-kernel:5.10.135-amd64";
pub const DEFAULT_FIRECRACKER_IMAGE: &str = "sourcegraph/executor-vm:insiders";
pub const CNI_BIN_DIR: &str = "/opt/cni/bin";
/// Address range carved into per-VM blocks. Chosen not to collide with docker's defaults.
pub const CNI_SUBNET_CIDR: &str = "10.61.0.0/16";

/// Isolation backend for job sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Firecracker,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Docker => "docker",
            BackendKind::Firecracker => "firecracker",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "firecracker" => Ok(BackendKind::Firecracker),
            other => Err(format!("Unknown sandbox backend: {}", other)),
        }
    }
}

/// Ceilings applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// VM root disk; docker applies it only with `docker_storage_quota`
    #[serde(default = "default_disk_mb")]
    pub disk_mb: u64,
    /// Bits per second, 0 for unlimited
    #[serde(default)]
    pub bandwidth_ingress_bps: u64,
    /// Bits per second, 0 for unlimited
    #[serde(default)]
    pub bandwidth_egress_bps: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            disk_mb: default_disk_mb(),
            bandwidth_ingress_bps: 0,
            bandwidth_egress_bps: 0,
        }
    }
}

fn default_cpus() -> u32 {
    4
}

fn default_memory_mb() -> u64 {
    12 * 1024
}

fn default_disk_mb() -> u64 {
    20 * 1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    #[serde(default = "default_vm_image")]
    pub image: String,
    #[serde(default = "default_kernel_image")]
    pub kernel_image: String,
    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,
    #[serde(default = "default_cni_bin_dir")]
    pub cni_bin_dir: PathBuf,
    #[serde(default = "default_subnet")]
    pub subnet: String,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            image: default_vm_image(),
            kernel_image: default_kernel_image(),
            sandbox_image: default_sandbox_image(),
            cni_bin_dir: default_cni_bin_dir(),
            subnet: default_subnet(),
        }
    }
}

fn default_vm_image() -> String {
    DEFAULT_FIRECRACKER_IMAGE.to_string()
}

fn default_kernel_image() -> String {
    DEFAULT_FIRECRACKER_KERNEL_IMAGE.to_string()
}

fn default_sandbox_image() -> String {
    format!("sourcegraph/ignite:{}", DEFAULT_IGNITE_VERSION)
}

fn default_cni_bin_dir() -> PathBuf {
    PathBuf::from(CNI_BIN_DIR)
}

fn default_subnet() -> String {
    CNI_SUBNET_CIDR.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Retryable failures a record may accumulate before it is errored
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Sandbox slots per worker process
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Concurrent workspace fetches per worker process
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Wall-clock budget for one job, provisioning excluded
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,

    /// Budget for a single workspace fetch attempt
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,

    /// Attempts after the first failed fetch
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,

    /// Backoff before fetch retry `n` is `n` times this
    #[serde(default = "default_fetch_backoff")]
    pub fetch_retry_backoff_millis: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    /// Pause between claims when the queue is empty
    #[serde(default = "default_poll_interval")]
    pub poll_interval_millis: u64,

    /// Time in-flight jobs get to finish after shutdown is requested
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Time a sandbox gets to stop before it is killed
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,

    /// Job workspaces are created below this directory
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Repositories are fetched from `<clone_base_url>/<repository name>`
    #[serde(default = "default_clone_base_url")]
    pub clone_base_url: String,

    /// Image for steps that do not name one
    #[serde(default = "default_step_image")]
    pub default_step_image: String,

    /// Variables a job may request from the executor's environment
    #[serde(default)]
    pub env_allowlist: Vec<String>,

    /// Indexer outputs are kept below this directory
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Enforce `resources.disk_mb` with `--storage-opt size`. Needs a storage
    /// driver with quota support.
    #[serde(default)]
    pub docker_storage_quota: bool,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub firecracker: FirecrackerConfig,
}

fn default_store_url() -> String {
    DEFAULT_STATE_STORE_URL.to_string()
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_job_timeout() -> u64 {
    60 * 60
}

fn default_fetch_timeout() -> u64 {
    5 * 60
}

fn default_fetch_retries() -> u32 {
    2
}

fn default_fetch_backoff() -> u64 {
    1000
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_stop_grace() -> u64 {
    10
}

fn default_working_dir() -> PathBuf {
    std::env::temp_dir().join("autoindex-executor")
}

fn default_clone_base_url() -> String {
    "http://localhost:3080/.executors/git".to_string()
}

fn default_step_image() -> String {
    "alpine:3".to_string()
}

fn default_artifact_dir() -> PathBuf {
    std::env::temp_dir().join("autoindex-artifacts")
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            store_url: default_store_url(),
            max_retries: default_max_retries(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            job_timeout_seconds: default_job_timeout(),
            fetch_timeout_seconds: default_fetch_timeout(),
            fetch_retries: default_fetch_retries(),
            fetch_retry_backoff_millis: default_fetch_backoff(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            poll_interval_millis: default_poll_interval(),
            shutdown_grace_seconds: default_shutdown_grace(),
            stop_grace_seconds: default_stop_grace(),
            working_dir: default_working_dir(),
            clone_base_url: default_clone_base_url(),
            default_step_image: default_step_image(),
            env_allowlist: Vec::new(),
            artifact_dir: default_artifact_dir(),
            docker_storage_quota: false,
            resources: ResourceLimits::default(),
            firecracker: FirecrackerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ExecutorError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ExecutorConfig =
            toml::from_str(content).map_err(|e| ExecutorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_concurrent_jobs", self.max_concurrent_jobs as u64),
            ("max_concurrent_fetches", self.max_concurrent_fetches as u64),
            ("job_timeout_seconds", self.job_timeout_seconds),
            ("fetch_timeout_seconds", self.fetch_timeout_seconds),
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            ("poll_interval_millis", self.poll_interval_millis),
            ("resources.cpus", self.resources.cpus as u64),
            ("resources.memory_mb", self.resources.memory_mb),
        ];
        if self.max_retries < 1 {
            return Err(ExecutorError::Config(
                "max_retries must be at least 1".to_string(),
            ));
        }
        for (name, value) in positive {
            if value == 0 {
                return Err(ExecutorError::Config(format!("{} must be positive", name)));
            }
        }
        if self.backend == BackendKind::Firecracker {
            if self.resources.disk_mb == 0 {
                return Err(ExecutorError::Config(
                    "resources.disk_mb must be positive for firecracker".to_string(),
                ));
            }
            crate::sandbox::network::parse_cidr(&self.firecracker.subnet)
                .map_err(ExecutorError::Config)?;
        }
        if let Some(name) = self
            .env_allowlist
            .iter()
            .find(|name| name.is_empty() || name.contains('='))
        {
            return Err(ExecutorError::Config(format!(
                "env_allowlist entry '{}' is not a variable name",
                name
            )));
        }
        if self.backend == BackendKind::Docker && !self.docker_storage_quota {
            warn!(
                disk_mb = self.resources.disk_mb,
                "Docker sandboxes do not enforce resources.disk_mb unless docker_storage_quota is set"
            );
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: self.fetch_timeout(),
            retries: self.fetch_retries,
            backoff: Duration::from_millis(self.fetch_retry_backoff_millis),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}
