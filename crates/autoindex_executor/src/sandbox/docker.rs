//! Docker container backend.
//!
//! Each sandbox owns a private bridge network; every step runs in its own
//! container on that network with the workspace bind-mounted at `/data`.
//! All containers carry the sandbox label so teardown finds them even when
//! the client process was killed mid-step. Step variables are named on the
//! command line and handed over through the client's environment, so their
//! values never show up in a process listing.

use async_trait::async_trait;
use autoindex_protocol::CommandStep;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::runner::{CommandOutput, CommandRunner, CommandSpec};
use super::{step_dir, step_image, step_script, SandboxBackend, SandboxHandle, SandboxSpec, SANDBOX_LABEL};
use crate::config::BackendKind;
use crate::error::{SandboxError, SandboxResult};

const MOUNT: &str = "/data";
/// Bound on docker CLI calls made during provision and teardown.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DockerBackend {
    runner: Arc<dyn CommandRunner>,
    default_image: String,
    stop_grace: Duration,
    /// Pass `resources.disk_mb` as a container storage quota.
    storage_quota: bool,
}

impl DockerBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, default_image: String, stop_grace: Duration) -> Self {
        Self {
            runner,
            default_image,
            stop_grace,
            storage_quota: false,
        }
    }

    /// Only overlay2 on xfs with project quotas and a few other drivers
    /// accept `--storage-opt size`; elsewhere `docker run` refuses to start.
    pub fn with_storage_quota(mut self, enabled: bool) -> Self {
        self.storage_quota = enabled;
        self
    }

    fn label(name: &str) -> String {
        format!("{}={}", SANDBOX_LABEL, name)
    }

    async fn docker(&self, args: Vec<String>, timeout: Duration) -> SandboxResult<CommandOutput> {
        self.runner
            .run(&CommandSpec::new("docker").args(args), Some(timeout))
            .await
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn provision(&self, spec: &SandboxSpec) -> SandboxResult<SandboxHandle> {
        let output = self
            .docker(
                vec![
                    "network".into(),
                    "create".into(),
                    "--label".into(),
                    Self::label(&spec.name),
                    spec.name.clone(),
                ],
                CONTROL_TIMEOUT,
            )
            .await
            .map_err(|e| SandboxError::Provision(e.to_string()))?;
        if !output.success() {
            return Err(SandboxError::Provision(format!(
                "docker network create {} exited with {:?}: {}",
                spec.name,
                output.exit_code,
                output.output.trim()
            )));
        }

        info!(sandbox = %spec.name, "Provisioned docker sandbox");
        Ok(SandboxHandle::new(spec, BackendKind::Docker, None))
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        step: &CommandStep,
        index: usize,
        timeout: Duration,
    ) -> SandboxResult<CommandOutput> {
        let limits = &handle.limits;
        let mut args = vec![
            "run".to_string(),
            "--rm".into(),
            "--name".into(),
            format!("{}-{}", handle.name, index),
            "--label".into(),
            Self::label(&handle.name),
            "--network".into(),
            handle.name.clone(),
            "--cpus".into(),
            limits.cpus.to_string(),
            "--memory".into(),
            format!("{}m", limits.memory_mb),
        ];
        if self.storage_quota {
            args.push("--storage-opt".into());
            args.push(format!("size={}m", limits.disk_mb));
        }
        for (name, _) in &handle.env {
            args.push("-e".into());
            args.push(name.clone());
        }
        args.extend([
            "-v".to_string(),
            format!("{}:{}", handle.workspace.display(), MOUNT),
            "-w".into(),
            step_dir(MOUNT, step),
            "--entrypoint".into(),
            "/bin/sh".into(),
            step_image(step, &self.default_image).to_string(),
            "-c".into(),
            step_script(step),
        ]);

        let mut cmd = CommandSpec::new("docker").args(args);
        for (name, value) in &handle.env {
            cmd = cmd.env(name.clone(), value.clone());
        }
        debug!(sandbox = %handle.name, step = index, "Running step in container");
        self.runner.run(&cmd, Some(timeout)).await
    }

    async fn destroy(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let listed = self
            .docker(
                vec![
                    "ps".into(),
                    "-aq".into(),
                    "--filter".into(),
                    format!("label={}", Self::label(&handle.name)),
                ],
                CONTROL_TIMEOUT,
            )
            .await?;
        let containers: Vec<String> = listed
            .output
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut failure = None;
        if !containers.is_empty() {
            let mut stop = vec![
                "stop".to_string(),
                "-t".into(),
                self.stop_grace.as_secs().to_string(),
            ];
            stop.extend(containers.iter().cloned());
            if let Err(e) = self.docker(stop, self.stop_grace + CONTROL_TIMEOUT).await {
                warn!(sandbox = %handle.name, error = %e, "docker stop failed; forcing removal");
            }

            let mut rm = vec!["rm".to_string(), "-f".into()];
            rm.extend(containers.iter().cloned());
            match self.docker(rm, CONTROL_TIMEOUT).await {
                Ok(output) if output.success() => {}
                Ok(output) => failure = Some(output.output.trim().to_string()),
                Err(e) => failure = Some(e.to_string()),
            }
        }

        match self
            .docker(
                vec!["network".into(), "rm".into(), handle.name.clone()],
                CONTROL_TIMEOUT,
            )
            .await
        {
            Ok(output) if output.success() => {}
            Ok(output) => {
                failure.get_or_insert_with(|| output.output.trim().to_string());
            }
            Err(e) => {
                failure.get_or_insert_with(|| e.to_string());
            }
        }

        match failure {
            None => {
                info!(sandbox = %handle.name, containers = containers.len(), "Destroyed docker sandbox");
                Ok(())
            }
            Some(message) => Err(SandboxError::Destroy {
                name: handle.name.clone(),
                message,
            }),
        }
    }
}
