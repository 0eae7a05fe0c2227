//! Matcher behavior against an in-memory git metadata fake.

use async_trait::async_trait;
use autoindex_policies::{
    Facet, FacetLimits, GitMetadataProvider, IndexingExtractor, NoopExtractor, PolicyError,
    PolicyMatcher, ProviderError, ProviderResult, RefDescription, RefType, Repository,
    RetentionExtractor,
};
use autoindex_protocol::{ConfigurationPolicy, GitObjectType, RepositoryId};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn days_ago(days: i64) -> DateTime<Utc> {
    now() - Duration::days(days)
}

#[derive(Default)]
struct FakeGit {
    repositories: Vec<Repository>,
    commits: HashMap<(RepositoryId, String), DateTime<Utc>>,
    refs: HashMap<RepositoryId, HashMap<String, Vec<RefDescription>>>,
    unique: HashMap<(RepositoryId, String), Vec<(String, DateTime<Utc>)>>,
}

impl FakeGit {
    fn repo(mut self, id: RepositoryId, name: &str) -> Self {
        self.repositories.push(Repository {
            id,
            name: name.to_string(),
        });
        self.refs.entry(id).or_default();
        self
    }

    fn commit(mut self, repo: RepositoryId, sha: &str, date: DateTime<Utc>) -> Self {
        self.commits.insert((repo, sha.to_string()), date);
        self
    }

    fn reference(
        mut self,
        repo: RepositoryId,
        sha: &str,
        name: &str,
        ref_type: RefType,
        is_default_branch: bool,
    ) -> Self {
        let date = self.commits[&(repo, sha.to_string())];
        self.refs
            .entry(repo)
            .or_default()
            .entry(sha.to_string())
            .or_default()
            .push(RefDescription {
                name: name.to_string(),
                ref_type,
                is_default_branch,
                created_date: date,
            });
        self
    }

    fn tag(self, repo: RepositoryId, sha: &str, name: &str) -> Self {
        self.reference(repo, sha, name, RefType::Tag, false)
    }

    fn branch(self, repo: RepositoryId, sha: &str, name: &str, is_default: bool) -> Self {
        self.reference(repo, sha, name, RefType::Branch, is_default)
    }

    fn unique_commits(mut self, repo: RepositoryId, branch: &str, shas: &[&str]) -> Self {
        let commits = shas
            .iter()
            .map(|sha| (sha.to_string(), self.commits[&(repo, sha.to_string())]))
            .collect();
        self.unique.insert((repo, branch.to_string()), commits);
        self
    }
}

#[async_trait]
impl GitMetadataProvider for FakeGit {
    async fn list_repositories(&self) -> ProviderResult<Vec<Repository>> {
        Ok(self.repositories.clone())
    }

    async fn resolve_revision(&self, repository_id: RepositoryId, revision: &str) -> ProviderResult<String> {
        if self.commits.contains_key(&(repository_id, revision.to_string())) {
            return Ok(revision.to_string());
        }
        Err(ProviderError::RevisionNotFound {
            repository_id,
            revision: revision.to_string(),
        })
    }

    async fn commit_exists(&self, repository_id: RepositoryId, commit: &str) -> ProviderResult<bool> {
        Ok(self.commits.contains_key(&(repository_id, commit.to_string())))
    }

    async fn commit_date(
        &self,
        repository_id: RepositoryId,
        commit: &str,
    ) -> ProviderResult<Option<DateTime<Utc>>> {
        Ok(self.commits.get(&(repository_id, commit.to_string())).copied())
    }

    async fn ref_descriptions(
        &self,
        repository_id: RepositoryId,
    ) -> ProviderResult<HashMap<String, Vec<RefDescription>>> {
        self.refs
            .get(&repository_id)
            .cloned()
            .ok_or(ProviderError::RepositoryNotFound(repository_id))
    }

    async fn commits_unique_to_branch(
        &self,
        repository_id: RepositoryId,
        branch: &str,
        _is_default_branch: bool,
        _max_age: Option<DateTime<Utc>>,
    ) -> ProviderResult<HashMap<String, DateTime<Utc>>> {
        Ok(self
            .unique
            .get(&(repository_id, branch.to_string()))
            .map(|commits| commits.iter().cloned().collect())
            .unwrap_or_default())
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

fn policy(id: i64, object_type: GitObjectType, pattern: &str) -> ConfigurationPolicy {
    ConfigurationPolicy {
        id,
        name: format!("policy-{}", id),
        protected: false,
        repository_id: Some(1),
        repository_patterns: None,
        object_type,
        pattern: pattern.to_string(),
        retention_enabled: true,
        retention_duration_hours: None,
        retain_intermediate_commits: false,
        indexing_enabled: true,
        index_commit_max_age_hours: None,
        index_intermediate_commits: false,
    }
}

fn release_repo() -> FakeGit {
    FakeGit::default()
        .repo(1, "github.com/acme/widgets")
        .commit(1, "c1", days_ago(45))
        .commit(1, "c2", days_ago(5))
        .commit(1, "c3", days_ago(1))
        .tag(1, "c1", "release-1")
        .tag(1, "c2", "release-2")
        .tag(1, "c3", "v1.0")
}

#[tokio::test]
async fn release_tags_within_thirty_days() {
    let matcher = PolicyMatcher::new(Arc::new(release_repo()));
    let mut p = policy(1, GitObjectType::Tag, "release-*");
    p.retention_duration_hours = Some(30 * 24);

    let matches = matcher.match_policy(&p, &RetentionExtractor, now()).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].commit, "c2");
    assert_eq!(matches[0].ref_name.as_deref(), Some("release-2"));
    assert_eq!(matches[0].repository_id, 1);
}

#[tokio::test]
async fn missing_max_age_never_excludes() {
    let matcher = PolicyMatcher::new(Arc::new(release_repo()));
    let p = policy(1, GitObjectType::Tag, "release-*");

    let matches = matcher.match_policy(&p, &RetentionExtractor, now()).await.unwrap();
    let commits: Vec<_> = matches.iter().map(|m| m.commit.as_str()).collect();
    assert_eq!(commits, vec!["c1", "c2"]);
}

#[tokio::test]
async fn facet_decides_age_limit() {
    let matcher = PolicyMatcher::new(Arc::new(release_repo()));
    let mut p = policy(1, GitObjectType::Tag, "release-*");
    p.retention_duration_hours = Some(24);
    p.index_commit_max_age_hours = Some(10 * 24);

    let retained = matcher.match_policy(&p, &RetentionExtractor, now()).await.unwrap();
    let indexed = matcher.match_policy(&p, &IndexingExtractor, now()).await.unwrap();
    let unlimited = matcher.match_policy(&p, &NoopExtractor, now()).await.unwrap();
    assert!(retained.is_empty());
    assert_eq!(indexed.len(), 1);
    assert_eq!(unlimited.len(), 2);
}

fn branch_repo() -> FakeGit {
    FakeGit::default()
        .repo(1, "github.com/acme/widgets")
        .commit(1, "m1", days_ago(2))
        .commit(1, "f3", days_ago(1))
        .commit(1, "f2", days_ago(3))
        .commit(1, "f1", days_ago(20))
        .commit(1, "g1", days_ago(4))
        .branch(1, "m1", "main", true)
        .branch(1, "f3", "feature/login", false)
        .branch(1, "g1", "feature/search", false)
        .unique_commits(1, "feature/login", &["f3", "f2", "f1"])
}

#[tokio::test]
async fn branch_tips_only_without_intermediate_commits() {
    let matcher = PolicyMatcher::new(Arc::new(branch_repo()));
    let p = policy(2, GitObjectType::Tree, "feature/*");

    let matches = matcher.match_policy(&p, &IndexingExtractor, now()).await.unwrap();
    let mut per_ref: HashMap<String, usize> = HashMap::new();
    for m in &matches {
        *per_ref.entry(m.ref_name.clone().unwrap()).or_default() += 1;
    }
    assert_eq!(matches.len(), 2);
    assert!(per_ref.values().all(|count| *count <= 1));
}

#[tokio::test]
async fn intermediate_commits_are_age_filtered_individually() {
    let matcher = PolicyMatcher::new(Arc::new(branch_repo()));
    let mut p = policy(2, GitObjectType::Tree, "feature/login");
    p.index_intermediate_commits = true;
    p.index_commit_max_age_hours = Some(7 * 24);

    let matches = matcher.match_policy(&p, &IndexingExtractor, now()).await.unwrap();
    let commits: Vec<_> = matches.iter().map(|m| m.commit.as_str()).collect();
    assert_eq!(commits, vec!["f2", "f3"]);
    assert!(matches
        .iter()
        .all(|m| m.ref_name.as_deref() == Some("feature/login")));
}

#[tokio::test]
async fn head_selects_default_branch() {
    let matcher = PolicyMatcher::new(Arc::new(branch_repo()));
    let p = policy(3, GitObjectType::Tree, "HEAD");

    let matches = matcher.match_policy(&p, &IndexingExtractor, now()).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].commit, "m1");
    assert_eq!(matches[0].ref_name.as_deref(), Some("main"));
}

#[tokio::test]
async fn commit_policy_resolves_literal() {
    let matcher = PolicyMatcher::new(Arc::new(branch_repo()));
    let found = matcher
        .match_policy(&policy(4, GitObjectType::Commit, "f1"), &NoopExtractor, now())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].ref_name, None);

    let missing = matcher
        .match_policy(&policy(4, GitObjectType::Commit, "deadbeef"), &NoopExtractor, now())
        .await
        .unwrap();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn zero_matching_refs_is_empty() {
    let matcher = PolicyMatcher::new(Arc::new(release_repo()));
    let matches = matcher
        .match_policy(&policy(5, GitObjectType::Tag, "nightly-*"), &NoopExtractor, now())
        .await
        .unwrap();
    assert!(matches.is_empty());
}

#[tokio::test]
async fn repository_patterns_expand_scope() {
    let git = release_repo()
        .repo(2, "github.com/other/tools")
        .commit(2, "x1", days_ago(1))
        .tag(2, "x1", "release-9");
    let matcher = PolicyMatcher::new(Arc::new(git));

    let mut p = policy(6, GitObjectType::Tag, "release-*");
    p.repository_id = None;
    p.repository_patterns = Some(vec!["github.com/acme/*".to_string()]);
    assert_eq!(matcher.repositories_in_scope(&p).await.unwrap(), vec![1]);

    p.repository_patterns = None;
    let mut scope = matcher.repositories_in_scope(&p).await.unwrap();
    scope.sort();
    assert_eq!(scope, vec![1, 2]);
}

#[tokio::test]
async fn invalid_pattern_is_isolated_by_evaluate_all() {
    let matcher = PolicyMatcher::new(Arc::new(release_repo()));
    let good = policy(1, GitObjectType::Tag, "release-*");
    let bad = policy(2, GitObjectType::Tag, "release-[");
    let mut disabled = policy(3, GitObjectType::Tag, "v*");
    disabled.indexing_enabled = false;

    let report = matcher
        .evaluate_all(&[good, bad, disabled], Facet::Indexing, now())
        .await;
    assert_eq!(report.evaluations.len(), 1);
    assert_eq!(report.evaluations[0].policy_id, 1);
    assert_eq!(report.evaluations[0].matches.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0],
        (2, PolicyError::InvalidPattern { .. })
    ));
}

#[tokio::test]
async fn preview_rejects_conflicting_scope() {
    let matcher = PolicyMatcher::new(Arc::new(release_repo()));
    let mut p = policy(7, GitObjectType::Tag, "release-*");
    p.repository_patterns = Some(vec!["*".to_string()]);

    let err = matcher.preview_policy(&p, &NoopExtractor, now()).await.unwrap_err();
    assert_eq!(err, PolicyError::ConflictingScope(7));
}

#[tokio::test]
async fn commits_described_by_policies_groups_by_commit() {
    let git = release_repo().branch(1, "c2", "main", true);
    let matcher = PolicyMatcher::new(Arc::new(git));
    let repo = Repository {
        id: 1,
        name: "github.com/acme/widgets".to_string(),
    };
    let mut other_repo = policy(3, GitObjectType::Tag, "*");
    other_repo.repository_id = Some(99);
    let policies = vec![
        policy(1, GitObjectType::Tag, "release-*"),
        policy(2, GitObjectType::Tree, "HEAD"),
        other_repo,
        policy(4, GitObjectType::Tag, "{broken"),
    ];

    let described = matcher
        .commits_described_by_policies(&repo, &policies, |p| Facet::Retention.extractor_for(p), now())
        .await
        .unwrap();
    assert_eq!(described.len(), 2);
    let ids: Vec<_> = described["c2"].iter().map(|m| m.policy_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(described["c1"].len(), 1);
}

#[tokio::test]
async fn unrepresentable_max_age_is_isolated_by_evaluate_all() {
    let matcher = PolicyMatcher::new(Arc::new(release_repo()));
    let good = policy(1, GitObjectType::Tag, "release-*");
    let mut decades = policy(2, GitObjectType::Tag, "release-*");
    decades.index_commit_max_age_hours = Some(10_000_000_000);
    let mut beyond_chrono = policy(3, GitObjectType::Tag, "release-*");
    beyond_chrono.index_commit_max_age_hours = Some(i64::MAX);

    let report = matcher
        .evaluate_all(&[good, decades, beyond_chrono], Facet::Indexing, now())
        .await;
    assert_eq!(report.evaluations.len(), 1);
    assert_eq!(report.evaluations[0].policy_id, 1);
    let failed: Vec<_> = report.failed.iter().map(|(id, _)| *id).collect();
    assert_eq!(failed, vec![2, 3]);
    assert!(report
        .failed
        .iter()
        .all(|(_, err)| matches!(err, PolicyError::InvalidMaxAge(_)) && err.is_configuration_error()));
}

#[tokio::test]
async fn preview_rejects_out_of_range_max_age() {
    let matcher = PolicyMatcher::new(Arc::new(release_repo()));
    let mut p = policy(8, GitObjectType::Tag, "release-*");
    p.retention_duration_hours = Some(10_000_000_000);

    let err = matcher
        .preview_policy(&p, &RetentionExtractor, now())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::InvalidMaxAge(_)));

    p.retention_duration_hours = Some(-2);
    let err = matcher.preview_policy(&p, &NoopExtractor, now()).await.unwrap_err();
    assert!(matches!(err, PolicyError::InvalidMaxAge(_)));
}

#[tokio::test]
async fn closure_extractor_with_unbounded_age_fails_cleanly() {
    let matcher = PolicyMatcher::new(Arc::new(release_repo()));
    let p = policy(9, GitObjectType::Tag, "release-*");
    let forever = |_: &ConfigurationPolicy| FacetLimits {
        max_age: Some(Duration::MAX),
        include_intermediate_commits: false,
    };

    let err = matcher.match_policy(&p, &forever, now()).await.unwrap_err();
    assert!(matches!(err, PolicyError::InvalidMaxAge(_)));
}
