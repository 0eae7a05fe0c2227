//! Workspace materialisation: a shallow checkout of one commit on the host.

use async_trait::async_trait;
use autoindex_protocol::log_tail;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SandboxError, SandboxResult};
use crate::metrics::METRICS;
use crate::sandbox::{CommandRunner, CommandSpec};

const GIT_ERROR_TAIL_BYTES: usize = 2048;

#[async_trait]
pub trait WorkspaceFetcher: Send + Sync {
    /// Populate `dir` with the tree of `commit`. `dir` exists and may hold
    /// leftovers of an earlier attempt.
    async fn materialize(&self, repository: &str, commit: &str, dir: &Path) -> SandboxResult<()>;
}

/// Fetches `<clone_base_url>/<repository>` at a single commit with git.
pub struct GitWorkspaceFetcher {
    runner: Arc<dyn CommandRunner>,
    clone_base_url: String,
}

impl GitWorkspaceFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>, clone_base_url: impl Into<String>) -> Self {
        Self {
            runner,
            clone_base_url: clone_base_url.into(),
        }
    }

    pub fn clone_url(&self, repository: &str) -> String {
        format!(
            "{}/{}",
            self.clone_base_url.trim_end_matches('/'),
            repository.trim_start_matches('/')
        )
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> SandboxResult<()> {
        let spec = CommandSpec::new("git")
            .arg("-C")
            .arg(dir.display().to_string())
            .args(args.iter().copied())
            .env("GIT_TERMINAL_PROMPT", "0");
        let output = self.runner.run(&spec, None).await?;
        if !output.success() {
            return Err(SandboxError::Fetch(format!(
                "git {} exited with {:?}: {}",
                args.first().copied().unwrap_or_default(),
                output.exit_code,
                log_tail(output.output.trim(), GIT_ERROR_TAIL_BYTES)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceFetcher for GitWorkspaceFetcher {
    async fn materialize(&self, repository: &str, commit: &str, dir: &Path) -> SandboxResult<()> {
        let url = self.clone_url(repository);
        self.git(dir, &["init", "--quiet"]).await?;
        self.git(
            dir,
            &["fetch", "--quiet", "--no-tags", "--depth", "1", url.as_str(), commit],
        )
        .await?;
        self.git(dir, &["checkout", "--quiet", "--force", "--detach", "FETCH_HEAD"])
            .await?;
        debug!(repository, commit, dir = %dir.display(), "Materialized workspace");
        Ok(())
    }
}

/// Fetch policy: per-attempt timeout, extra attempts, linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

/// Materialize with retries. These retries are separate from the job's own
/// retry budget. Returns the last error once attempts run out, or as soon as
/// `cancel` fires.
pub async fn fetch_with_retries(
    fetcher: &dyn WorkspaceFetcher,
    repository: &str,
    commit: &str,
    dir: &Path,
    policy: FetchPolicy,
    cancel: &CancellationToken,
) -> SandboxResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        METRICS.inc_fetch_attempts();
        let result = match tokio::time::timeout(
            policy.timeout,
            fetcher.materialize(repository, commit, dir),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Fetch(format!(
                "fetch timed out after {} seconds",
                policy.timeout.as_secs()
            ))),
        };

        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        METRICS.inc_fetch_failures();
        if attempt > policy.retries {
            return Err(err);
        }
        warn!(repository, commit, attempt, error = %err, "Workspace fetch failed; retrying");

        tokio::select! {
            _ = cancel.cancelled() => return Err(err),
            _ = tokio::time::sleep(policy.backoff * attempt) => {}
        }
    }
}
