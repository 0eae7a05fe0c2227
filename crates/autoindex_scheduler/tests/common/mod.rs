//! Shared fixtures: in-memory store and fakes for the capability traits.

#![allow(dead_code)]

use async_trait::async_trait;
use autoindex_policies::{
    GitMetadataProvider, ProviderError, ProviderResult, RefDescription, RefType, Repository,
};
use autoindex_protocol::{
    ConfigurationPolicy, GitObjectType, HintConfidence, IndexJobHint, IndexJobSpec, RepositoryId,
    Trigger,
};
use autoindex_scheduler::{InferenceEngine, InferenceError, NewIndex, RepositoryDirectory};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn job(indexer: &str) -> IndexJobSpec {
    IndexJobSpec {
        indexer: indexer.to_string(),
        steps: vec![],
        indexer_args: vec![indexer.to_string(), "index".to_string()],
        root: String::new(),
        outfile: "index.scip".to_string(),
        local_steps: vec![],
        requested_env_vars: vec![],
    }
}

pub fn new_index(repository_id: RepositoryId, commit: &str, configuration: &str) -> NewIndex {
    NewIndex {
        repository_id,
        repository_name: format!("repo-{}", repository_id),
        commit: commit.to_string(),
        configuration: configuration.to_string(),
        job: job("scip-go"),
        trigger: Trigger::Manual,
        policy_id: None,
    }
}

pub fn head_policy(patterns: &[&str]) -> ConfigurationPolicy {
    ConfigurationPolicy {
        id: 0,
        name: "default branches".to_string(),
        protected: false,
        repository_id: None,
        repository_patterns: Some(patterns.iter().map(|p| p.to_string()).collect()),
        object_type: GitObjectType::Tree,
        pattern: "HEAD".to_string(),
        retention_enabled: false,
        retention_duration_hours: None,
        retain_intermediate_commits: false,
        indexing_enabled: true,
        index_commit_max_age_hours: None,
        index_intermediate_commits: false,
    }
}

/// Repositories with a single default branch each.
#[derive(Default)]
pub struct FakeGit {
    repositories: Vec<Repository>,
    tips: HashMap<RepositoryId, (String, DateTime<Utc>)>,
}

impl FakeGit {
    pub fn with_repo(mut self, id: RepositoryId, name: &str, tip: &str) -> Self {
        self.repositories.push(Repository {
            id,
            name: name.to_string(),
        });
        self.tips.insert(id, (tip.to_string(), t0() - Duration::days(1)));
        self
    }

    pub fn repositories(&self) -> Vec<Repository> {
        self.repositories.clone()
    }
}

#[async_trait]
impl GitMetadataProvider for FakeGit {
    async fn list_repositories(&self) -> ProviderResult<Vec<Repository>> {
        Ok(self.repositories.clone())
    }

    async fn resolve_revision(
        &self,
        repository_id: RepositoryId,
        revision: &str,
    ) -> ProviderResult<String> {
        let (tip, _) = self
            .tips
            .get(&repository_id)
            .ok_or(ProviderError::RepositoryNotFound(repository_id))?;
        if revision == "HEAD" || revision == "main" || revision == tip {
            return Ok(tip.clone());
        }
        Err(ProviderError::RevisionNotFound {
            repository_id,
            revision: revision.to_string(),
        })
    }

    async fn commit_exists(&self, repository_id: RepositoryId, commit: &str) -> ProviderResult<bool> {
        Ok(self
            .tips
            .get(&repository_id)
            .map_or(false, |(tip, _)| tip == commit))
    }

    async fn commit_date(
        &self,
        repository_id: RepositoryId,
        commit: &str,
    ) -> ProviderResult<Option<DateTime<Utc>>> {
        Ok(self
            .tips
            .get(&repository_id)
            .filter(|(tip, _)| tip == commit)
            .map(|(_, date)| *date))
    }

    async fn ref_descriptions(
        &self,
        repository_id: RepositoryId,
    ) -> ProviderResult<HashMap<String, Vec<RefDescription>>> {
        let (tip, date) = self
            .tips
            .get(&repository_id)
            .ok_or(ProviderError::RepositoryNotFound(repository_id))?;
        Ok(HashMap::from([(
            tip.clone(),
            vec![RefDescription {
                name: "main".to_string(),
                ref_type: RefType::Branch,
                is_default_branch: true,
                created_date: *date,
            }],
        )]))
    }

    async fn commits_unique_to_branch(
        &self,
        _repository_id: RepositoryId,
        _branch: &str,
        _is_default_branch: bool,
        _max_age: Option<DateTime<Utc>>,
    ) -> ProviderResult<HashMap<String, DateTime<Utc>>> {
        Ok(HashMap::new())
    }

    async fn raw_contents(
        &self,
        _repository_id: RepositoryId,
        _commit: &str,
        _path: &str,
    ) -> ProviderResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Inference results configured per repository; unconfigured repositories
/// infer one `scip-go` job.
#[derive(Default)]
pub struct FakeInference {
    results: Mutex<HashMap<RepositoryId, Result<Vec<IndexJobSpec>, InferenceError>>>,
    pub calls: AtomicUsize,
    pub last_script: Mutex<Option<String>>,
}

impl FakeInference {
    pub fn set(&self, repository_id: RepositoryId, result: Result<Vec<IndexJobSpec>, InferenceError>) {
        self.results.lock().unwrap().insert(repository_id, result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for FakeInference {
    async fn infer_index_jobs(
        &self,
        repository: &Repository,
        _commit: &str,
        script: Option<&str>,
    ) -> Result<Vec<IndexJobSpec>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_script.lock().unwrap() = script.map(str::to_string);
        self.results
            .lock()
            .unwrap()
            .get(&repository.id)
            .cloned()
            .unwrap_or_else(|| Ok(vec![job("scip-go")]))
    }

    async fn infer_index_job_hints(
        &self,
        _repository: &Repository,
        _commit: &str,
        _script: Option<&str>,
    ) -> Result<Vec<IndexJobHint>, InferenceError> {
        Ok(vec![IndexJobHint {
            indexer: "scip-python".to_string(),
            root: "tools".to_string(),
            confidence: HintConfidence::Speculative,
        }])
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    repositories: Vec<Repository>,
    pub refreshes: Mutex<Vec<RepositoryId>>,
}

impl FakeDirectory {
    pub fn new(repositories: Vec<Repository>) -> Self {
        Self {
            repositories,
            refreshes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RepositoryDirectory for FakeDirectory {
    async fn resolve(&self, name: &str) -> ProviderResult<Option<Repository>> {
        Ok(self.repositories.iter().find(|r| r.name == name).cloned())
    }

    async fn get(&self, id: RepositoryId) -> ProviderResult<Option<Repository>> {
        Ok(self.repositories.iter().find(|r| r.id == id).cloned())
    }

    async fn enqueue_refresh(&self, id: RepositoryId) -> ProviderResult<()> {
        self.refreshes.lock().unwrap().push(id);
        Ok(())
    }
}
