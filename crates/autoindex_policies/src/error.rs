//! Error types for policy matching.

use autoindex_protocol::{PolicyId, RepositoryId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolicyError>;

/// Failure reported by a Git Metadata Provider implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Repository {0} not found")]
    RepositoryNotFound(RepositoryId),

    #[error("Revision '{revision}' not found in repository {repository_id}")]
    RevisionNotFound {
        repository_id: RepositoryId,
        revision: String,
    },

    /// Network trouble, git service down, timeouts.
    #[error("Git metadata provider unavailable: {0}")]
    Unavailable(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Errors surfaced while evaluating a single policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Policy {0} sets both a repository id and repository patterns")]
    ConflictingScope(PolicyId),

    #[error("Invalid max age: {0}")]
    InvalidMaxAge(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl PolicyError {
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Configuration errors are the policy author's problem; provider errors are not.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            PolicyError::InvalidPattern { .. }
                | PolicyError::ConflictingScope(_)
                | PolicyError::InvalidMaxAge(_)
        )
    }
}
