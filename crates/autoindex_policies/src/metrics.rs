//! Matcher counters.
//!
//! Lock-free atomics, read for observability only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    /// Policies whose repository membership changed on refresh
    pub policies_updated: AtomicU64,
    pub policy_evaluations: AtomicU64,
    pub policy_errors: AtomicU64,
    pub commits_matched: AtomicU64,
    pub evaluation_time_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            policies_updated: AtomicU64::new(0),
            policy_evaluations: AtomicU64::new(0),
            policy_errors: AtomicU64::new(0),
            commits_matched: AtomicU64::new(0),
            evaluation_time_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_policies_updated(&self) {
        self.policies_updated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_policy_evaluations(&self) {
        self.policy_evaluations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_policy_errors(&self) {
        self.policy_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_commits_matched(&self, n: u64) {
        self.commits_matched.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evaluation_time(&self, start: Instant) {
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.evaluation_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            policies_updated: self.policies_updated.load(Ordering::Relaxed),
            policy_evaluations: self.policy_evaluations.load(Ordering::Relaxed),
            policy_errors: self.policy_errors.load(Ordering::Relaxed),
            commits_matched: self.commits_matched.load(Ordering::Relaxed),
            evaluation_time_us: self.evaluation_time_us.load(Ordering::Relaxed),
        }
    }

    /// Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP autoindex_policies_updated_total Policies whose repository membership changed
# TYPE autoindex_policies_updated_total counter
autoindex_policies_updated_total {}

# HELP autoindex_policy_evaluations_total Policy evaluations run by the matcher
# TYPE autoindex_policy_evaluations_total counter
autoindex_policy_evaluations_total {}

# HELP autoindex_policy_errors_total Policy evaluations that failed
# TYPE autoindex_policy_errors_total counter
autoindex_policy_errors_total {}

# HELP autoindex_commits_matched_total Commits emitted by policy evaluations
# TYPE autoindex_commits_matched_total counter
autoindex_commits_matched_total {}

# HELP autoindex_policy_evaluation_microseconds_total Cumulative evaluation time in microseconds
# TYPE autoindex_policy_evaluation_microseconds_total counter
autoindex_policy_evaluation_microseconds_total {}
"#,
            s.policies_updated,
            s.policy_evaluations,
            s.policy_errors,
            s.commits_matched,
            s.evaluation_time_us,
        )
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub policies_updated: u64,
    pub policy_evaluations: u64,
    pub policy_errors: u64,
    pub commits_matched: u64,
    pub evaluation_time_us: u64,
}

impl MetricsSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "Policies: {} evaluated, {} failed, {} membership updates | Commits matched: {}",
            self.policy_evaluations, self.policy_errors, self.policies_updated, self.commits_matched,
        )
    }
}
