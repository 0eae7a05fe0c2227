//! Capabilities the scheduler consumes: job inference and repository lookup.

use async_trait::async_trait;
use autoindex_policies::{ProviderError, ProviderResult, Repository};
use autoindex_protocol::{IndexJobHint, IndexJobSpec, RepositoryId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// The inference script raised or produced malformed output.
    #[error("Inference failed: {0}")]
    Failed(String),

    #[error("Inference timed out")]
    Timeout,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Produces index jobs for a repository at a commit, typically by running an
/// inference script over the repository's file tree.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// `script` replaces the built-in inference rules when set.
    async fn infer_index_jobs(
        &self,
        repository: &Repository,
        commit: &str,
        script: Option<&str>,
    ) -> Result<Vec<IndexJobSpec>, InferenceError>;

    async fn infer_index_job_hints(
        &self,
        repository: &Repository,
        commit: &str,
        script: Option<&str>,
    ) -> Result<Vec<IndexJobHint>, InferenceError>;
}

#[async_trait]
pub trait RepositoryDirectory: Send + Sync {
    /// Look a repository up by name.
    async fn resolve(&self, name: &str) -> ProviderResult<Option<Repository>>;

    async fn get(&self, id: RepositoryId) -> ProviderResult<Option<Repository>>;

    /// Ask the git service to fetch the repository again, e.g. after a
    /// revision could not be resolved.
    async fn enqueue_refresh(&self, id: RepositoryId) -> ProviderResult<()>;
}
