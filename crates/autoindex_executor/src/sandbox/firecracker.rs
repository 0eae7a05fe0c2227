//! Firecracker micro-VM backend, driven through the ignite CLI.
//!
//! Every VM gets a dedicated `/29`, its own CNI conflist and bridge, and the
//! configured CPU, memory, disk and bandwidth ceilings. The workspace is
//! copied into the VM at `/work`; steps run as containers inside the VM.

use async_trait::async_trait;
use autoindex_protocol::CommandStep;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::network::{cni_conflist, SubnetAllocator, SubnetLease};
use super::runner::{CommandOutput, CommandRunner, CommandSpec};
use super::{shell_quote, step_dir, step_image, step_script, SandboxBackend, SandboxHandle, SandboxSpec};
use crate::config::{BackendKind, FirecrackerConfig};
use crate::error::{SandboxError, SandboxResult};

const VM_WORKSPACE: &str = "/work";
const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

pub struct FirecrackerBackend {
    runner: Arc<dyn CommandRunner>,
    config: FirecrackerConfig,
    default_image: String,
    /// Per-VM conflists live in `<cni_conf_root>/<vm name>/`.
    cni_conf_root: PathBuf,
    stop_grace: Duration,
    subnets: SubnetAllocator,
}

impl FirecrackerBackend {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: FirecrackerConfig,
        default_image: String,
        cni_conf_root: PathBuf,
        stop_grace: Duration,
    ) -> Result<Self, String> {
        let subnets = SubnetAllocator::new(&config.subnet)?;
        Ok(Self {
            runner,
            config,
            default_image,
            cni_conf_root,
            stop_grace,
            subnets,
        })
    }

    pub fn subnets(&self) -> &SubnetAllocator {
        &self.subnets
    }

    fn conf_dir(&self, name: &str) -> PathBuf {
        self.cni_conf_root.join(name)
    }

    async fn ignite(&self, spec: CommandSpec, timeout: Duration) -> SandboxResult<CommandOutput> {
        self.runner.run(&spec, Some(timeout)).await
    }

    async fn start_vm(&self, spec: &SandboxSpec, lease: &SubnetLease) -> SandboxResult<()> {
        let conf_dir = self.conf_dir(&spec.name);
        tokio::fs::create_dir_all(&conf_dir).await?;
        let conflist = cni_conflist(&spec.name, lease, &spec.limits);
        let body = serde_json::to_vec_pretty(&conflist)
            .map_err(|e| SandboxError::Provision(e.to_string()))?;
        tokio::fs::write(conf_dir.join(format!("{}.conflist", spec.name)), body).await?;

        let limits = &spec.limits;
        let cmd = CommandSpec::new("ignite")
            .args([
                "run".to_string(),
                self.config.image.clone(),
                "--name".into(),
                spec.name.clone(),
                "--cpus".into(),
                limits.cpus.to_string(),
                "--memory".into(),
                format!("{}MB", limits.memory_mb),
                "--size".into(),
                format!("{}MB", limits.disk_mb),
                "--kernel-image".into(),
                self.config.kernel_image.clone(),
                "--sandbox-image".into(),
                self.config.sandbox_image.clone(),
                "--runtime".into(),
                "docker".into(),
                "--network-plugin".into(),
                "cni".into(),
                "--ssh".into(),
            ])
            .env("CNI_CONF_DIR", conf_dir.display().to_string())
            .env("CNI_PATH", self.config.cni_bin_dir.display().to_string());

        let output = self.ignite(cmd, CONTROL_TIMEOUT).await?;
        if !output.success() {
            return Err(SandboxError::Provision(format!(
                "ignite run {} exited with {:?}: {}",
                spec.name,
                output.exit_code,
                output.output.trim()
            )));
        }
        Ok(())
    }

    async fn remove_conf(&self, name: &str) {
        let dir = self.conf_dir(name);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox = name, error = %e, "Failed to remove CNI configuration");
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for FirecrackerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Firecracker
    }

    async fn provision(&self, spec: &SandboxSpec) -> SandboxResult<SandboxHandle> {
        // Dropped before `keep` (failure or an abandoned provision), the
        // guard hands the block back.
        let guard = self.subnets.allocate_guarded()?;
        if let Err(e) = self.start_vm(spec, guard.lease()).await {
            // A half-started VM may exist; remove it before giving the block back.
            let rm = CommandSpec::new("ignite").args(["rm", "-f", spec.name.as_str()]);
            if let Err(rm_err) = self.ignite(rm, CONTROL_TIMEOUT).await {
                warn!(sandbox = %spec.name, error = %rm_err, "Cleanup after failed provision failed");
            }
            self.remove_conf(&spec.name).await;
            return Err(match e {
                SandboxError::Provision(_) => e,
                other => SandboxError::Provision(other.to_string()),
            });
        }
        let lease = guard.keep();

        info!(sandbox = %spec.name, subnet = %lease.cidr(), "Provisioned firecracker sandbox");
        Ok(SandboxHandle::new(spec, BackendKind::Firecracker, Some(lease)))
    }

    async fn sync_workspace(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let cmd = CommandSpec::new("ignite").args([
            "cp".to_string(),
            handle.workspace.display().to_string(),
            format!("{}:{}", handle.name, VM_WORKSPACE),
        ]);
        let output = self.ignite(cmd, CONTROL_TIMEOUT).await?;
        if !output.success() {
            return Err(SandboxError::Exec(format!(
                "ignite cp into {} exited with {:?}: {}",
                handle.name,
                output.exit_code,
                output.output.trim()
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        step: &CommandStep,
        index: usize,
        timeout: Duration,
    ) -> SandboxResult<CommandOutput> {
        // ignite exec goes through ssh, which hands the remote shell one string.
        let env: String = handle
            .env
            .iter()
            .map(|(name, value)| format!("-e {} ", shell_quote(&format!("{}={}", name, value))))
            .collect();
        let remote = format!(
            "docker run --rm --name step-{} {}-v {}:/data -w {} --entrypoint /bin/sh {} -c {}",
            index,
            env,
            VM_WORKSPACE,
            shell_quote(&step_dir("/data", step)),
            shell_quote(step_image(step, &self.default_image)),
            shell_quote(&step_script(step)),
        );
        let cmd = CommandSpec::new("ignite").args(["exec".to_string(), handle.name.clone(), remote]);
        self.ignite(cmd, timeout).await
    }

    async fn retrieve(&self, handle: &SandboxHandle, path: &str) -> SandboxResult<Option<PathBuf>> {
        let remote = format!("{}/{}", VM_WORKSPACE, path.trim_start_matches('/'));
        let exists = CommandSpec::new("ignite").args([
            "exec".to_string(),
            handle.name.clone(),
            format!("test -f {}", shell_quote(&remote)),
        ]);
        if !self.ignite(exists, CONTROL_TIMEOUT).await?.success() {
            return Ok(None);
        }

        let host = handle.workspace.join(path);
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let cp = CommandSpec::new("ignite").args([
            "cp".to_string(),
            format!("{}:{}", handle.name, remote),
            host.display().to_string(),
        ]);
        let output = self.ignite(cp, CONTROL_TIMEOUT).await?;
        if !output.success() {
            return Err(SandboxError::Exec(format!(
                "ignite cp out of {} exited with {:?}: {}",
                handle.name,
                output.exit_code,
                output.output.trim()
            )));
        }
        Ok(Some(host))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let stop = CommandSpec::new("ignite").args(["stop", handle.name.as_str()]);
        match self.ignite(stop, self.stop_grace).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(
                sandbox = %handle.name,
                output = %output.output.trim(),
                "ignite stop failed; forcing removal"
            ),
            Err(e) => warn!(sandbox = %handle.name, error = %e, "ignite stop did not finish; forcing removal"),
        }

        let rm = CommandSpec::new("ignite").args(["rm", "-f", handle.name.as_str()]);
        let removed = self.ignite(rm, CONTROL_TIMEOUT).await;

        // Address block and CNI files are released even when removal failed,
        // so a stuck VM cannot starve the allocator.
        self.remove_conf(&handle.name).await;
        if let Some(lease) = &handle.lease {
            self.subnets.release(lease);
        }

        match removed {
            Ok(output) if output.success() => {
                info!(sandbox = %handle.name, "Destroyed firecracker sandbox");
                Ok(())
            }
            Ok(output) => Err(SandboxError::Destroy {
                name: handle.name.clone(),
                message: output.output.trim().to_string(),
            }),
            Err(e) => Err(SandboxError::Destroy {
                name: handle.name.clone(),
                message: e.to_string(),
            }),
        }
    }
}
