//! Error types for the store and the scheduler service.

use autoindex_policies::{PolicyError, ProviderError};
use autoindex_protocol::{PolicyId, RepositoryId};
use thiserror::Error;

use crate::inference::InferenceError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error("Invalid policy: {0}")]
    Validation(String),

    #[error("Policy {0} is protected")]
    Protected(PolicyId),

    /// Transition not allowed from the record's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("Repository {0} not found")]
    RepositoryNotFound(RepositoryId),

    /// Override or stored configuration text that does not parse.
    #[error("Invalid index configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid scheduler settings: {0}")]
    Settings(String),
}
