//! Queue and scheduler counters.
//!
//! Lock-free atomics, never consulted for control flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Queue lifecycle
    pub indexes_enqueued: AtomicU64,
    pub indexes_coalesced: AtomicU64,
    pub indexes_claimed: AtomicU64,
    pub indexes_completed: AtomicU64,
    pub indexes_failed: AtomicU64,
    pub indexes_retried: AtomicU64,
    pub indexes_cancelled: AtomicU64,
    pub indexes_reclaimed: AtomicU64,

    // Scheduling
    pub scheduler_cycles: AtomicU64,
    pub repositories_scanned: AtomicU64,
    pub inference_failures: AtomicU64,
    pub repository_errors: AtomicU64,

    pub cycle_time_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            indexes_enqueued: AtomicU64::new(0),
            indexes_coalesced: AtomicU64::new(0),
            indexes_claimed: AtomicU64::new(0),
            indexes_completed: AtomicU64::new(0),
            indexes_failed: AtomicU64::new(0),
            indexes_retried: AtomicU64::new(0),
            indexes_cancelled: AtomicU64::new(0),
            indexes_reclaimed: AtomicU64::new(0),
            scheduler_cycles: AtomicU64::new(0),
            repositories_scanned: AtomicU64::new(0),
            inference_failures: AtomicU64::new(0),
            repository_errors: AtomicU64::new(0),
            cycle_time_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_indexes_enqueued(&self) {
        self.indexes_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_indexes_coalesced(&self) {
        self.indexes_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_indexes_claimed(&self) {
        self.indexes_claimed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_indexes_completed(&self) {
        self.indexes_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_indexes_failed(&self) {
        self.indexes_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_indexes_retried(&self) {
        self.indexes_retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_indexes_cancelled(&self) {
        self.indexes_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_indexes_reclaimed(&self, n: u64) {
        self.indexes_reclaimed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_scheduler_cycles(&self) {
        self.scheduler_cycles.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_repositories_scanned(&self, n: u64) {
        self.repositories_scanned.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_inference_failures(&self) {
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_repository_errors(&self) {
        self.repository_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycle_time(&self, start: Instant) {
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.cycle_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            indexes_enqueued: self.indexes_enqueued.load(Ordering::Relaxed),
            indexes_coalesced: self.indexes_coalesced.load(Ordering::Relaxed),
            indexes_claimed: self.indexes_claimed.load(Ordering::Relaxed),
            indexes_completed: self.indexes_completed.load(Ordering::Relaxed),
            indexes_failed: self.indexes_failed.load(Ordering::Relaxed),
            indexes_retried: self.indexes_retried.load(Ordering::Relaxed),
            indexes_cancelled: self.indexes_cancelled.load(Ordering::Relaxed),
            indexes_reclaimed: self.indexes_reclaimed.load(Ordering::Relaxed),
            scheduler_cycles: self.scheduler_cycles.load(Ordering::Relaxed),
            repositories_scanned: self.repositories_scanned.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            repository_errors: self.repository_errors.load(Ordering::Relaxed),
            cycle_time_us: self.cycle_time_us.load(Ordering::Relaxed),
        }
    }

    /// Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let counters: [(&str, &str, u64); 13] = [
            ("indexes_enqueued_total", "Index records created", s.indexes_enqueued),
            ("indexes_coalesced_total", "Enqueue requests folded into a pending record", s.indexes_coalesced),
            ("indexes_claimed_total", "Index records claimed by workers", s.indexes_claimed),
            ("indexes_completed_total", "Index records completed", s.indexes_completed),
            ("indexes_failed_total", "Index records terminally errored", s.indexes_failed),
            ("indexes_retried_total", "Retryable failures sent back to the queue", s.indexes_retried),
            ("indexes_cancelled_total", "Index records cancelled", s.indexes_cancelled),
            ("indexes_reclaimed_total", "Processing records reclaimed after heartbeat loss", s.indexes_reclaimed),
            ("scheduler_cycles_total", "Scheduling cycles run", s.scheduler_cycles),
            ("repositories_scanned_total", "Repositories scanned for auto-indexing", s.repositories_scanned),
            ("inference_failures_total", "Failed inference attempts", s.inference_failures),
            ("repository_errors_total", "Repositories whose scan failed", s.repository_errors),
            ("scheduler_cycle_microseconds_total", "Cumulative cycle time in microseconds", s.cycle_time_us),
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
    pub indexes_enqueued: u64,
    pub indexes_coalesced: u64,
    pub indexes_claimed: u64,
    pub indexes_completed: u64,
    pub indexes_failed: u64,
    pub indexes_retried: u64,
    pub indexes_cancelled: u64,
    pub indexes_reclaimed: u64,
    pub scheduler_cycles: u64,
    pub repositories_scanned: u64,
    pub inference_failures: u64,
    pub repository_errors: u64,
    pub cycle_time_us: u64,
}

impl MetricsSnapshot {
    pub fn avg_cycle_time_ms(&self) -> f64 {
        if self.scheduler_cycles == 0 {
            0.0
        } else {
            (self.cycle_time_us as f64 / self.scheduler_cycles as f64) / 1000.0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Indexes: {} enqueued ({} coalesced), {} claimed, {} completed, {} failed, {} retried | \
             Cycles: {} (avg {:.2}ms), {} repositories scanned",
            self.indexes_enqueued,
            self.indexes_coalesced,
            self.indexes_claimed,
            self.indexes_completed,
            self.indexes_failed,
            self.indexes_retried,
            self.scheduler_cycles,
            self.avg_cycle_time_ms(),
            self.repositories_scanned,
        )
    }
}
