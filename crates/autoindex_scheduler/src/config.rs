//! Scheduler tuning.

use autoindex_protocol::defaults::{
    DEFAULT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_INFERENCE_FAILURE_THRESHOLD, DEFAULT_MAX_RETRIES,
    DEFAULT_SCAN_BATCH_SIZE, DEFAULT_SCAN_MIN_DELAY_SECS, DEFAULT_SCHEDULER_INTERVAL_SECS,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between scheduling cycles
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Minimum time between two automatic scans of one repository
    #[serde(default = "default_scan_min_delay")]
    pub scan_min_delay_seconds: u64,

    /// Repositories claimed per cycle
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: i64,

    /// Retryable failures before a record is terminally errored
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Consecutive inference failures before automatic scheduling stops;
    /// zero disables suppression
    #[serde(default = "default_inference_failure_threshold")]
    pub inference_failure_threshold: i32,

    /// Processing records without a heartbeat for this long are reclaimed
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,

    /// Whether global policies alone make a repository due for scans
    #[serde(default)]
    pub allow_global_policies: bool,
}

fn default_interval() -> u64 {
    DEFAULT_SCHEDULER_INTERVAL_SECS
}

fn default_scan_min_delay() -> u64 {
    DEFAULT_SCAN_MIN_DELAY_SECS
}

fn default_scan_batch_size() -> i64 {
    DEFAULT_SCAN_BATCH_SIZE
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

fn default_inference_failure_threshold() -> i32 {
    DEFAULT_INFERENCE_FAILURE_THRESHOLD
}

fn default_heartbeat_timeout() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_SECS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            scan_min_delay_seconds: default_scan_min_delay(),
            scan_batch_size: default_scan_batch_size(),
            max_retries: default_max_retries(),
            inference_failure_threshold: default_inference_failure_threshold(),
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            allow_global_policies: false,
        }
    }
}

impl SchedulerConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Settings(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SchedulerConfig =
            toml::from_str(content).map_err(|e| SchedulerError::Settings(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_seconds == 0 {
            return Err(SchedulerError::Settings(
                "interval_seconds must be positive".to_string(),
            ));
        }
        if self.scan_batch_size <= 0 {
            return Err(SchedulerError::Settings(
                "scan_batch_size must be positive".to_string(),
            ));
        }
        if self.max_retries < 1 {
            return Err(SchedulerError::Settings(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_timeout_seconds == 0 {
            return Err(SchedulerError::Settings(
                "heartbeat_timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_seconds)
    }

    pub fn scan_min_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.scan_min_delay_seconds as i64)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_seconds as i64)
    }
}
