//! Executor counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Jobs
    pub jobs_claimed: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_retryable: AtomicU64,
    pub jobs_timed_out: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub report_errors: AtomicU64,

    // Sandboxes
    pub sandboxes_provisioned: AtomicU64,
    pub sandboxes_destroyed: AtomicU64,
    pub sandbox_errors: AtomicU64,
    pub artifacts_stored: AtomicU64,

    // Workspace fetches
    pub fetch_attempts: AtomicU64,
    pub fetch_failures: AtomicU64,

    pub heartbeat_failures: AtomicU64,
    pub job_time_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_claimed: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retryable: AtomicU64::new(0),
            jobs_timed_out: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            report_errors: AtomicU64::new(0),
            sandboxes_provisioned: AtomicU64::new(0),
            sandboxes_destroyed: AtomicU64::new(0),
            sandbox_errors: AtomicU64::new(0),
            artifacts_stored: AtomicU64::new(0),
            fetch_attempts: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            heartbeat_failures: AtomicU64::new(0),
            job_time_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_jobs_claimed(&self) {
        self.jobs_claimed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_retryable(&self) {
        self.jobs_retryable.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_timed_out(&self) {
        self.jobs_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_report_errors(&self) {
        self.report_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sandboxes_provisioned(&self) {
        self.sandboxes_provisioned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sandboxes_destroyed(&self) {
        self.sandboxes_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sandbox_errors(&self) {
        self.sandbox_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_artifacts_stored(&self) {
        self.artifacts_stored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_fetch_attempts(&self) {
        self.fetch_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_fetch_failures(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_heartbeat_failures(&self) {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_job_time(&self, start: Instant) {
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.job_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_claimed: self.jobs_claimed.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retryable: self.jobs_retryable.load(Ordering::Relaxed),
            jobs_timed_out: self.jobs_timed_out.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            report_errors: self.report_errors.load(Ordering::Relaxed),
            sandboxes_provisioned: self.sandboxes_provisioned.load(Ordering::Relaxed),
            sandboxes_destroyed: self.sandboxes_destroyed.load(Ordering::Relaxed),
            sandbox_errors: self.sandbox_errors.load(Ordering::Relaxed),
            artifacts_stored: self.artifacts_stored.load(Ordering::Relaxed),
            fetch_attempts: self.fetch_attempts.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            job_time_us: self.job_time_us.load(Ordering::Relaxed),
        }
    }

    /// Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let counters: [(&str, &str, u64); 15] = [
            ("executor_jobs_claimed_total", "Jobs claimed from the queue", s.jobs_claimed),
            ("executor_jobs_succeeded_total", "Jobs whose steps all exited zero", s.jobs_succeeded),
            ("executor_jobs_failed_total", "Jobs reported as terminal failures", s.jobs_failed),
            ("executor_jobs_retryable_total", "Jobs reported as retryable infrastructure failures", s.jobs_retryable),
            ("executor_jobs_timed_out_total", "Jobs that exceeded their wall-clock budget", s.jobs_timed_out),
            ("executor_jobs_cancelled_total", "Jobs cancelled while running", s.jobs_cancelled),
            ("executor_report_errors_total", "Outcome reports the queue rejected", s.report_errors),
            ("executor_sandboxes_provisioned_total", "Sandboxes provisioned", s.sandboxes_provisioned),
            ("executor_sandboxes_destroyed_total", "Sandboxes destroyed", s.sandboxes_destroyed),
            ("executor_sandbox_errors_total", "Sandbox provision or teardown errors", s.sandbox_errors),
            ("executor_artifacts_stored_total", "Index artifacts handed to the artifact sink", s.artifacts_stored),
            ("executor_fetch_attempts_total", "Workspace fetch attempts", s.fetch_attempts),
            ("executor_fetch_failures_total", "Failed workspace fetch attempts", s.fetch_failures),
            ("executor_heartbeat_failures_total", "Heartbeats that could not reach the queue", s.heartbeat_failures),
            ("executor_job_microseconds_total", "Cumulative job time in microseconds", s.job_time_us),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP autoindex_{name} {help}\n# TYPE autoindex_{name} counter\nautoindex_{name} {value}\n\n"
            ));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retryable: u64,
    pub jobs_timed_out: u64,
    pub jobs_cancelled: u64,
    pub report_errors: u64,
    pub sandboxes_provisioned: u64,
    pub sandboxes_destroyed: u64,
    pub sandbox_errors: u64,
    pub artifacts_stored: u64,
    pub fetch_attempts: u64,
    pub fetch_failures: u64,
    pub heartbeat_failures: u64,
    pub job_time_us: u64,
}

impl MetricsSnapshot {
    /// Sandboxes provisioned but not yet destroyed.
    pub fn live_sandboxes(&self) -> u64 {
        self.sandboxes_provisioned
            .saturating_sub(self.sandboxes_destroyed)
    }

    pub fn summary(&self) -> String {
        format!(
            "Jobs: {} claimed, {} succeeded, {} failed, {} retryable, {} timed out, {} cancelled | \
             Sandboxes: {} live",
            self.jobs_claimed,
            self.jobs_succeeded,
            self.jobs_failed,
            self.jobs_retryable,
            self.jobs_timed_out,
            self.jobs_cancelled,
            self.live_sandboxes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_sandboxes() {
        let metrics = Metrics::new();
        metrics.inc_sandboxes_provisioned();
        metrics.inc_sandboxes_provisioned();
        metrics.inc_sandboxes_destroyed();
        assert_eq!(metrics.snapshot().live_sandboxes(), 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.inc_jobs_claimed();
        let output = metrics.prometheus_format();
        assert!(output.contains("autoindex_executor_jobs_claimed_total 1"));
        assert!(output.contains("# TYPE autoindex_executor_sandboxes_destroyed_total counter"));
    }
}
