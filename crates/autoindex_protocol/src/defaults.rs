//! Canonical default values shared by the scheduler and the executor.

pub const DEFAULT_STATE_STORE_URL: &str = "sqlite:autoindex.sqlite";

/// Retryable failures allowed before a record becomes terminally errored.
pub const DEFAULT_MAX_RETRIES: i32 = 3;
/// Consecutive inference failures before automatic scheduling is suppressed.
pub const DEFAULT_INFERENCE_FAILURE_THRESHOLD: i32 = 5;
/// Minimum delay between two automatic scans of the same repository.
pub const DEFAULT_SCAN_MIN_DELAY_SECS: u64 = 60 * 60;
/// Largest accepted policy age setting (200 years).
pub const MAX_POLICY_AGE_HOURS: i64 = 200 * 365 * 24;
pub const DEFAULT_SCAN_BATCH_SIZE: i64 = 100;
pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 2 * 60;

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
/// Processing records without a heartbeat for this long are reclaimed.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;

/// Indexer output file, relative to the job root, when the job names none.
pub const DEFAULT_INDEX_OUTFILE: &str = "index.scip";

/// Captured command output kept on a record, in bytes.
pub const MAX_EXECUTION_LOG_BYTES: usize = 64 * 1024;

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
pub const CANCELLED_BY_SHUTDOWN_MESSAGE: &str = "Cancelled by executor shutdown";
