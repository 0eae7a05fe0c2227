//! Read-only query surface of the git service, as the matcher consumes it.

use async_trait::async_trait;
use autoindex_protocol::RepositoryId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::ProviderResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    Branch,
    Tag,
}

/// A branch or tag pointing at a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefDescription {
    pub name: String,
    pub ref_type: RefType,
    pub is_default_branch: bool,
    /// Date of the commit the ref points at.
    pub created_date: DateTime<Utc>,
}

/// Git Metadata Provider capability.
///
/// Implemented by the git service client; the matcher and the scheduler only
/// ever hold it as `Arc<dyn GitMetadataProvider>`.
#[async_trait]
pub trait GitMetadataProvider: Send + Sync {
    /// All repositories known to the git service (for pattern scopes).
    async fn list_repositories(&self) -> ProviderResult<Vec<Repository>>;

    /// Resolve a revision (branch, tag, `HEAD`, abbreviated sha) to a commit id.
    async fn resolve_revision(
        &self,
        repository_id: RepositoryId,
        revision: &str,
    ) -> ProviderResult<String>;

    async fn commit_exists(&self, repository_id: RepositoryId, commit: &str) -> ProviderResult<bool>;

    /// Commit date, or `None` when the commit does not exist.
    async fn commit_date(
        &self,
        repository_id: RepositoryId,
        commit: &str,
    ) -> ProviderResult<Option<DateTime<Utc>>>;

    /// Refs keyed by the commit they point at.
    async fn ref_descriptions(
        &self,
        repository_id: RepositoryId,
    ) -> ProviderResult<HashMap<String, Vec<RefDescription>>>;

    /// Commits reachable from `branch` but not from the default branch, with
    /// their dates. For the default branch itself, every commit newer than
    /// `max_age`. Commits older than `max_age` may be omitted.
    async fn commits_unique_to_branch(
        &self,
        repository_id: RepositoryId,
        branch: &str,
        is_default_branch: bool,
        max_age: Option<DateTime<Utc>>,
    ) -> ProviderResult<HashMap<String, DateTime<Utc>>>;

    /// Contents of a file at a commit, `None` when it does not exist.
    async fn raw_contents(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        path: &str,
    ) -> ProviderResult<Option<Vec<u8>>>;
}
