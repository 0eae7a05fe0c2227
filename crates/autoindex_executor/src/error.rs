//! Executor error types.

use autoindex_scheduler::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecutorError>;
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Failures of the sandbox backends and the workspace fetcher.
///
/// Everything except [`SandboxError::Timeout`] is an infrastructure problem
/// and the job is retried.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox: {0}")]
    Provision(String),

    #[error("Failed to run command in sandbox: {0}")]
    Exec(String),

    #[error("Failed to destroy sandbox {name}: {message}")]
    Destroy { name: String, message: String },

    #[error("Failed to fetch workspace: {0}")]
    Fetch(String),

    #[error("Failed to store index artifact: {0}")]
    Artifact(String),

    #[error("No free address block left in {0}")]
    NetworkExhausted(String),

    #[error("Command timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Host binaries or plugins required by the configured backend are absent.
    #[error("Missing host capabilities: {}", .0.join(", "))]
    MissingCapabilities(Vec<String>),

    #[error("Invalid executor configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
