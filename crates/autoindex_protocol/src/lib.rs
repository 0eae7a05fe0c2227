//! Shared domain types for autoindex.
//!
//! Everything that crosses a crate boundary lives here: configuration
//! policies, index records and their states, job specs and hints, failure
//! categories, and the defaults both the scheduler and the executor read.

pub mod defaults;
pub mod idempotency;
pub mod types;

pub use idempotency::{configuration_key, ConfigurationSource};
pub use types::{
    CommandStep, ConfigurationPolicy, FailureCategory, GitObjectType, HintConfidence, Index,
    IndexConfiguration, IndexId, IndexJobHint, IndexJobSpec, IndexState, PolicyId, PolicyScope,
    RepositoryId, Trigger, log_tail,
};
