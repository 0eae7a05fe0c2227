//! Executor worker.
//!
//! Design principles:
//! - run() consumes self; one claim loop per process
//! - Sandbox slots bound concurrent jobs, fetch slots bound concurrent
//!   workspace downloads; both semaphores are process-local
//! - Every provision, finished or abandoned on cancel, is followed by
//!   exactly one destroy
//! - Artifacts leave the sandbox before it is torn down
//! - Shutdown stops claiming at once, waits `shutdown_grace` for in-flight
//!   jobs, then cancels the rest

use autoindex_protocol::defaults::{
    CANCELLED_BY_SHUTDOWN_MESSAGE, CANCELLED_BY_USER_MESSAGE, MAX_EXECUTION_LOG_BYTES,
};
use autoindex_protocol::{log_tail, FailureCategory, Index};
use autoindex_scheduler::JobOutcome;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactSink;
use crate::cancel::RunningJobs;
use crate::capabilities::{check_host, HostInspector};
use crate::config::ExecutorConfig;
use crate::error::Result;
use crate::job_source::JobSource;
use crate::metrics::METRICS;
use crate::sandbox::{SandboxBackend, SandboxHandle, SandboxSpec};
use crate::workspace::{fetch_with_retries, WorkspaceFetcher};

/// Combined output of a job's steps, clipped to the stored size.
#[derive(Debug, Default)]
struct ExecutionLog {
    text: Mutex<String>,
}

impl ExecutionLog {
    fn push(&self, chunk: &str) {
        let mut text = self.text.lock().unwrap_or_else(|e| e.into_inner());
        text.push_str(chunk);
        if !chunk.ends_with('\n') {
            text.push('\n');
        }
        if text.len() > 2 * MAX_EXECUTION_LOG_BYTES {
            let kept = log_tail(&text, MAX_EXECUTION_LOG_BYTES).to_string();
            *text = kept;
        }
    }

    fn snapshot(&self) -> Option<String> {
        let text = self.text.lock().unwrap_or_else(|e| e.into_inner());
        if text.is_empty() {
            None
        } else {
            Some(log_tail(&text, MAX_EXECUTION_LOG_BYTES).to_string())
        }
    }
}

fn retryable(message: String, log: &ExecutionLog) -> JobOutcome {
    JobOutcome::RetryableFailure {
        message,
        category: FailureCategory::Infrastructure,
        execution_log: log.snapshot(),
    }
}

fn terminal(message: String, category: FailureCategory, log: &ExecutionLog) -> JobOutcome {
    JobOutcome::TerminalFailure {
        message,
        category,
        execution_log: log.snapshot(),
    }
}

/// State shared by the claim loop, job tasks and the heartbeat task.
struct Shared {
    worker_id: String,
    config: ExecutorConfig,
    source: Arc<dyn JobSource>,
    backend: Arc<dyn SandboxBackend>,
    fetcher: Arc<dyn WorkspaceFetcher>,
    artifacts: Arc<dyn ArtifactSink>,
    fetch_slots: Semaphore,
    running: RunningJobs,
}

pub struct Worker {
    shared: Arc<Shared>,
    sandbox_slots: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        config: ExecutorConfig,
        source: Arc<dyn JobSource>,
        backend: Arc<dyn SandboxBackend>,
        fetcher: Arc<dyn WorkspaceFetcher>,
        artifacts: Arc<dyn ArtifactSink>,
    ) -> Self {
        let sandbox_slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        let fetch_slots = Semaphore::new(config.max_concurrent_fetches.max(1));
        Self {
            shared: Arc::new(Shared {
                worker_id: worker_id.into(),
                config,
                source,
                backend,
                fetcher,
                artifacts,
                fetch_slots,
                running: RunningJobs::new(),
            }),
            sandbox_slots,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    /// Verify host prerequisites, then run. Nothing is claimed when the check fails.
    pub async fn run_checked(self, inspector: &dyn HostInspector, shutdown: CancellationToken) -> Result<()> {
        check_host(&self.shared.config, inspector)?;
        self.run(shutdown).await
    }

    /// Claim and execute jobs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let shared = self.shared.clone();
        info!(
            worker = %shared.worker_id,
            backend = %shared.backend.kind(),
            max_jobs = shared.config.max_concurrent_jobs,
            "Executor worker started"
        );

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone(), heartbeat_stop.clone()));
        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.sandbox_slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            // A claim is not raced against shutdown: dropping it midway could
            // leave a record processing with nobody running it.
            if shutdown.is_cancelled() {
                break;
            }

            match shared.source.claim(&shared.worker_id).await {
                Ok(Some(index)) => {
                    let shared = shared.clone();
                    tasks.spawn(async move {
                        process(shared, index).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => debug!("No queued index jobs"),
                Err(e) => error!(error = %e, "Failed to claim index job"),
            }
            drop(permit);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(shared.config.poll_interval()) => {}
            }
        }

        info!(in_flight = tasks.len(), "Stopped claiming; draining in-flight jobs");
        let grace = shared.config.shutdown_grace();
        if tokio::time::timeout(grace, drain(&mut tasks)).await.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_secs = grace.as_secs(),
                "Shutdown grace elapsed; cancelling in-flight jobs"
            );
            shared.running.cancel_all_for_shutdown();
            drain(&mut tasks).await;
        }

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            error!(error = %e, "Heartbeat task failed");
        }
        info!(worker = %shared.worker_id, "Executor worker stopped");
        Ok(())
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        log_join_error(joined);
    }
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Job task panicked or was aborted");
    }
}

/// Run one claimed job and report its outcome.
async fn process(shared: Arc<Shared>, index: Index) {
    let start = Instant::now();
    METRICS.inc_jobs_claimed();
    let cancel = shared.running.register(index.id);
    info!(
        index_id = index.id,
        repository = %index.repository_name,
        commit = %index.commit,
        retry_count = index.retry_count,
        "Processing index job"
    );

    let outcome = shared.execute(&index, &cancel).await;
    shared.running.remove(index.id);

    match &outcome {
        JobOutcome::Completed { .. } => METRICS.inc_jobs_succeeded(),
        JobOutcome::RetryableFailure { message, .. } => {
            METRICS.inc_jobs_retryable();
            warn!(index_id = index.id, error = %message, "Index job failed (retryable)");
        }
        JobOutcome::TerminalFailure {
            message, category, ..
        } => {
            if *category == FailureCategory::Timeout {
                METRICS.inc_jobs_timed_out();
            }
            METRICS.inc_jobs_failed();
            error!(index_id = index.id, category = %category, error = %message, "Index job failed");
        }
        JobOutcome::Cancelled { .. } => METRICS.inc_jobs_cancelled(),
    }

    match shared
        .source
        .report(index.id, &shared.worker_id, &outcome)
        .await
    {
        Ok(state) => info!(index_id = index.id, state = %state, "Reported index outcome"),
        Err(e) => {
            METRICS.inc_report_errors();
            warn!(index_id = index.id, error = %e, "Failed to report index outcome");
        }
    }
    METRICS.record_job_time(start);
}

/// Requested variables that are allowlisted and set on this host.
fn resolve_env(
    requested: &[String],
    allowlist: &[String],
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    for name in requested {
        if env.iter().any(|(seen, _)| seen == name) {
            continue;
        }
        if !allowlist.iter().any(|allowed| allowed == name) {
            warn!(variable = %name, "Requested variable is not allowlisted; skipping");
            continue;
        }
        match lookup(name) {
            Some(value) => env.push((name.clone(), value)),
            None => warn!(variable = %name, "Requested variable is not set on this executor; skipping"),
        }
    }
    env
}

impl Shared {
    fn cancelled(&self, log: &ExecutionLog) -> JobOutcome {
        if self.running.is_shutting_down() {
            // Not the job's fault; let another worker pick it up.
            retryable(CANCELLED_BY_SHUTDOWN_MESSAGE.to_string(), log)
        } else {
            JobOutcome::Cancelled {
                message: CANCELLED_BY_USER_MESSAGE.to_string(),
                execution_log: log.snapshot(),
            }
        }
    }

    async fn execute(&self, index: &Index, cancel: &CancellationToken) -> JobOutcome {
        let log = ExecutionLog::default();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("autoindex-{}-{}", index.id, &suffix[..8]);
        let workspace = self.config.working_dir.join(&name);

        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            return retryable(
                format!("Failed to create workspace {}: {}", workspace.display(), e),
                &log,
            );
        }
        if cancel.is_cancelled() {
            remove_workspace(&workspace).await;
            return self.cancelled(&log);
        }

        let spec = SandboxSpec {
            name,
            workspace: workspace.clone(),
            limits: self.config.resources.clone(),
            env: resolve_env(
                &index.job.requested_env_vars,
                &self.config.env_allowlist,
                |name| std::env::var(name).ok(),
            ),
        };
        let provisioned = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.backend.provision(&spec) => Some(result),
        };
        let handle = match provisioned {
            Some(Ok(handle)) => {
                METRICS.inc_sandboxes_provisioned();
                handle
            }
            Some(Err(e)) => {
                METRICS.inc_sandbox_errors();
                remove_workspace(&workspace).await;
                return retryable(e.to_string(), &log);
            }
            None => {
                // Whatever the abandoned provision created is found by name.
                let partial = SandboxHandle::new(&spec, self.backend.kind(), None);
                match self.backend.destroy(&partial).await {
                    Ok(()) => METRICS.inc_sandboxes_destroyed(),
                    Err(e) => debug!(
                        index_id = index.id,
                        sandbox = %partial.name,
                        error = %e,
                        "Teardown after abandoned provision"
                    ),
                }
                remove_workspace(&workspace).await;
                return self.cancelled(&log);
            }
        };

        let job_timeout = self.config.job_timeout();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => self.cancelled(&log),
            result = tokio::time::timeout(job_timeout, self.run_in_sandbox(index, &handle, cancel, &log)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => terminal(
                        format!("Job exceeded its {} second timeout", job_timeout.as_secs()),
                        FailureCategory::Timeout,
                        &log,
                    ),
                }
            }
        };

        match self.backend.destroy(&handle).await {
            Ok(()) => METRICS.inc_sandboxes_destroyed(),
            Err(e) => {
                METRICS.inc_sandbox_errors();
                error!(index_id = index.id, sandbox = %handle.name, error = %e, "Sandbox teardown failed");
            }
        }
        remove_workspace(&workspace).await;
        outcome
    }

    async fn run_in_sandbox(
        &self,
        index: &Index,
        handle: &SandboxHandle,
        cancel: &CancellationToken,
        log: &ExecutionLog,
    ) -> JobOutcome {
        let fetched = match self.fetch_slots.acquire().await {
            Ok(_permit) => {
                fetch_with_retries(
                    self.fetcher.as_ref(),
                    &index.repository_name,
                    &index.commit,
                    &handle.workspace,
                    self.config.fetch_policy(),
                    cancel,
                )
                .await
            }
            Err(_) => return retryable("Fetch slots closed".to_string(), log),
        };
        if let Err(e) = fetched {
            return retryable(e.to_string(), log);
        }
        if let Err(e) = self.backend.sync_workspace(handle).await {
            return retryable(e.to_string(), log);
        }

        let steps = index.job.execution_steps();
        for (i, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.cancelled(log);
            }
            log.push(&format!("$ [step {}] {}", i, step.commands.join(" && ")));
            match self
                .backend
                .execute(handle, step, i, self.config.job_timeout())
                .await
            {
                Ok(output) => {
                    log.push(&output.output);
                    if !output.success() {
                        let status = output
                            .exit_code
                            .map_or_else(|| "a signal".to_string(), |code| format!("status {}", code));
                        return terminal(
                            format!("Step {} exited with {}", i, status),
                            FailureCategory::CommandFailed,
                            log,
                        );
                    }
                }
                Err(e) if e.is_timeout() => {
                    return terminal(e.to_string(), FailureCategory::Timeout, log);
                }
                Err(e) => return retryable(e.to_string(), log),
            }
        }

        if let Some(path) = index.job.artifact_path() {
            if cancel.is_cancelled() {
                return self.cancelled(log);
            }
            let artifact = match self.backend.retrieve(handle, &path).await {
                Ok(Some(artifact)) => artifact,
                Ok(None) => {
                    return terminal(
                        format!("Indexer did not produce {}", path),
                        FailureCategory::CommandFailed,
                        log,
                    );
                }
                Err(e) => return retryable(e.to_string(), log),
            };
            if let Err(e) = self.artifacts.store(index, &artifact).await {
                return retryable(e.to_string(), log);
            }
            METRICS.inc_artifacts_stored();
        }

        JobOutcome::Completed {
            execution_log: log.snapshot(),
        }
    }
}

async fn remove_workspace(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove workspace");
        }
    }
}

/// Keep claimed records alive and pick up cancellations.
async fn heartbeat_loop(shared: Arc<Shared>, stop: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config.heartbeat_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }

        let ids = shared.running.ids();
        if ids.is_empty() {
            continue;
        }
        match shared.source.heartbeat(&shared.worker_id, &ids).await {
            Ok(response) => {
                for id in &response.cancel {
                    if shared.running.cancel(*id) {
                        info!(index_id = id, "Cancellation requested");
                    }
                }
                for id in ids.iter().filter(|id| !response.known.contains(id)) {
                    if shared.running.cancel(*id) {
                        warn!(index_id = id, "Claim no longer held by this worker; abandoning job");
                    }
                }
            }
            Err(e) => {
                METRICS.inc_heartbeat_failures();
                warn!(error = %e, "Heartbeat failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_env_keeps_allowlisted_and_set() {
        let requested = vec![
            "NPM_TOKEN".to_string(),
            "AWS_SECRET".to_string(),
            "GOPROXY".to_string(),
            "NPM_TOKEN".to_string(),
        ];
        let allowlist = vec!["NPM_TOKEN".to_string(), "GOPROXY".to_string()];
        let env = resolve_env(&requested, &allowlist, |name| {
            (name != "GOPROXY").then(|| format!("{}-value", name))
        });
        assert_eq!(
            env,
            vec![("NPM_TOKEN".to_string(), "NPM_TOKEN-value".to_string())]
        );
        assert!(resolve_env(&requested, &[], |_| Some("x".to_string())).is_empty());
    }

    #[test]
    fn test_log_snapshot_is_clipped() {
        let log = ExecutionLog::default();
        assert_eq!(log.snapshot(), None);
        log.push("hello");
        assert_eq!(log.snapshot().as_deref(), Some("hello\n"));

        let big = "x".repeat(MAX_EXECUTION_LOG_BYTES);
        log.push(&big);
        log.push(&big);
        log.push("tail");
        let snapshot = log.snapshot().unwrap();
        assert_eq!(snapshot.len(), MAX_EXECUTION_LOG_BYTES);
        assert!(snapshot.ends_with("tail\n"));
    }
}
