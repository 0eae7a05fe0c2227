//! Sandbox provisioner.
//!
//! A [`SandboxBackend`] turns a [`SandboxSpec`] into an isolated environment,
//! runs job steps inside it and tears it down. Two backends exist: docker
//! containers and firecracker micro-VMs driven through ignite. Neither shares
//! a filesystem or network namespace between two sandboxes.

pub mod docker;
pub mod firecracker;
pub mod network;
pub mod runner;

use async_trait::async_trait;
use autoindex_protocol::CommandStep;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendKind, ExecutorConfig, ResourceLimits};
use crate::error::{ExecutorError, Result, SandboxResult};

pub use docker::DockerBackend;
pub use firecracker::FirecrackerBackend;
pub use network::{LeaseGuard, SubnetAllocator, SubnetLease};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};

/// Label put on every docker object a sandbox creates.
pub const SANDBOX_LABEL: &str = "autoindex.sandbox";

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    /// Unique per sandbox; used for container, VM and network names.
    pub name: String,
    /// Host directory holding the job's checkout.
    pub workspace: PathBuf,
    pub limits: ResourceLimits,
    /// Variables exported to every step.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxHandle {
    pub name: String,
    pub kind: BackendKind,
    pub workspace: PathBuf,
    pub limits: ResourceLimits,
    pub env: Vec<(String, String)>,
    /// Dedicated address block, micro-VMs only.
    pub lease: Option<SubnetLease>,
}

impl SandboxHandle {
    pub fn new(spec: &SandboxSpec, kind: BackendKind, lease: Option<SubnetLease>) -> Self {
        Self {
            name: spec.name.clone(),
            kind,
            workspace: spec.workspace.clone(),
            limits: spec.limits.clone(),
            env: spec.env.clone(),
            lease,
        }
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn provision(&self, spec: &SandboxSpec) -> SandboxResult<SandboxHandle>;

    /// Make the host workspace visible inside the sandbox. Bind-mounting
    /// backends have nothing to do.
    async fn sync_workspace(&self, _handle: &SandboxHandle) -> SandboxResult<()> {
        Ok(())
    }

    /// Run step `index` of a job. A non-zero exit is a normal result, not an error.
    async fn execute(
        &self,
        handle: &SandboxHandle,
        step: &CommandStep,
        index: usize,
        timeout: Duration,
    ) -> SandboxResult<CommandOutput>;

    /// Bring the workspace-relative file `path` back to the host. `None` when
    /// the sandbox holds no such file. Bind-mounting backends only look.
    async fn retrieve(&self, handle: &SandboxHandle, path: &str) -> SandboxResult<Option<PathBuf>> {
        let host = handle.workspace.join(path);
        Ok(tokio::fs::try_exists(&host).await?.then_some(host))
    }

    /// Release everything `provision` allocated, killing whatever still runs.
    async fn destroy(&self, handle: &SandboxHandle) -> SandboxResult<()>;
}

/// Backend selected by the executor configuration.
pub fn build_backend(
    config: &ExecutorConfig,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn SandboxBackend>> {
    let backend: Arc<dyn SandboxBackend> = match config.backend {
        BackendKind::Docker => Arc::new(
            DockerBackend::new(
                runner,
                config.default_step_image.clone(),
                config.stop_grace(),
            )
            .with_storage_quota(config.docker_storage_quota),
        ),
        BackendKind::Firecracker => Arc::new(
            FirecrackerBackend::new(
                runner,
                config.firecracker.clone(),
                config.default_step_image.clone(),
                config.working_dir.join("cni"),
                config.stop_grace(),
            )
            .map_err(ExecutorError::Config)?,
        ),
    };
    Ok(backend)
}

/// Shell script for one step; stops at the first failing command.
pub(crate) fn step_script(step: &CommandStep) -> String {
    let mut script = String::from("set -e\n");
    for command in &step.commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}

/// Step working directory below `mount`.
pub(crate) fn step_dir(mount: &str, step: &CommandStep) -> String {
    let root = step.root.trim_matches('/');
    if root.is_empty() {
        mount.to_string()
    } else {
        format!("{}/{}", mount, root)
    }
}

pub(crate) fn step_image<'a>(step: &'a CommandStep, default_image: &'a str) -> &'a str {
    if step.image.is_empty() {
        default_image
    } else {
        &step.image
    }
}

/// Single-quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
