//! Index job scheduling.
//!
//! The state store keeps configuration policies, their repository membership,
//! the index queue and per-repository scan bookkeeping. [`IndexScheduler`]
//! turns policy matches and manual requests into queued index records;
//! [`SchedulerLoop`] drives it periodically.

pub mod config;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod scheduler;
pub mod scheduler_loop;
pub mod store;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError, StoreError, StoreResult};
pub use inference::{InferenceEngine, InferenceError, RepositoryDirectory};
pub use scheduler::{CycleSummary, IndexScheduler, InferredConfiguration, MembershipRefresh};
pub use scheduler_loop::SchedulerLoop;
pub use store::{
    EnqueueOutcome, HeartbeatResponse, IndexFilter, IndexQueue, JobOutcome, NewIndex, PolicyStore,
    QueueStats, ReclaimSummary, RepositoryConfigStore, RepositoryScan, ScanKind, Store,
};
