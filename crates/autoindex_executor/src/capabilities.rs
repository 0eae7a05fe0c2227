//! Host prerequisites, checked once before the worker claims anything.

use std::path::Path;
use tracing::{error, info};

use crate::config::{BackendKind, ExecutorConfig};
use crate::error::{ExecutorError, Result};

/// Programs every executor needs in `PATH`.
pub const REQUIRED_TOOLS: &[&str] = &["docker", "git"];

/// Additional programs for the firecracker backend.
pub const REQUIRED_TOOLS_FIRECRACKER: &[&str] = &["dmsetup", "losetup", "mkfs.ext4", "ignite"];

/// CNI plugins ignite needs in the CNI bin directory. `bandwidth` throttles
/// each VM, `isolation` separates the per-VM bridges, `portmap` is required
/// by ignite although nothing is port-mapped.
pub const REQUIRED_CNI_PLUGINS: &[&str] = &[
    "bandwidth",
    "bridge",
    "firewall",
    "host-local",
    "isolation",
    "loopback",
    "portmap",
];

pub trait HostInspector: Send + Sync {
    fn has_binary(&self, name: &str) -> bool;
    fn has_file(&self, path: &Path) -> bool;
}

/// Looks at the real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostInspector for SystemHost {
    fn has_binary(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    fn has_file(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Every prerequisite of `config.backend` the host lacks.
pub fn missing_capabilities(config: &ExecutorConfig, inspector: &dyn HostInspector) -> Vec<String> {
    let mut missing: Vec<String> = REQUIRED_TOOLS
        .iter()
        .filter(|tool| !inspector.has_binary(tool))
        .map(|tool| tool.to_string())
        .collect();

    if config.backend == BackendKind::Firecracker {
        missing.extend(
            REQUIRED_TOOLS_FIRECRACKER
                .iter()
                .filter(|tool| !inspector.has_binary(tool))
                .map(|tool| tool.to_string()),
        );
        for plugin in REQUIRED_CNI_PLUGINS {
            let path = config.firecracker.cni_bin_dir.join(plugin);
            if !inspector.has_file(&path) {
                missing.push(path.display().to_string());
            }
        }
    }
    missing
}

pub fn check_host(config: &ExecutorConfig, inspector: &dyn HostInspector) -> Result<()> {
    let missing = missing_capabilities(config, inspector);
    if !missing.is_empty() {
        error!(
            backend = %config.backend,
            missing = %missing.join(", "),
            "Host is missing required capabilities"
        );
        return Err(ExecutorError::MissingCapabilities(missing));
    }
    info!(backend = %config.backend, "Host capabilities verified");
    Ok(())
}
