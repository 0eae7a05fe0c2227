//! Policy matcher.
//!
//! Turns a configuration policy into the concrete set of (repository, commit)
//! pairs it selects. Retention and indexing both go through [`PolicyMatcher`];
//! the [`Extractor`] passed in decides which facet's age limit and
//! intermediate-commit flag apply.

use autoindex_protocol::defaults::MAX_POLICY_AGE_HOURS;
use autoindex_protocol::{ConfigurationPolicy, GitObjectType, PolicyId, PolicyScope, RepositoryId};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use globset::GlobMatcher;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::{PolicyError, Result};
use crate::extractor::{Extractor, Facet, FacetLimits};
use crate::git::{GitMetadataProvider, RefDescription, RefType, Repository};
use crate::metrics::METRICS;
use crate::patterns::{self, DEFAULT_BRANCH_PATTERN};

/// One commit selected by one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyMatch {
    pub repository_id: RepositoryId,
    pub commit: String,
    /// Tag or branch through which the commit matched; `None` for commit policies.
    pub ref_name: Option<String>,
    pub policy_id: PolicyId,
    /// Commit date the age filter was applied to.
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PolicyEvaluation {
    pub policy_id: PolicyId,
    pub matches: Vec<PolicyMatch>,
}

/// Outcome of evaluating many policies; failures never abort the batch.
#[derive(Debug, Default)]
pub struct EvaluationReport {
    pub evaluations: Vec<PolicyEvaluation>,
    pub failed: Vec<(PolicyId, PolicyError)>,
}

enum Selector {
    Commit(String),
    Tag(GlobMatcher),
    DefaultBranch,
    Branch(GlobMatcher),
}

impl Selector {
    fn for_policy(policy: &ConfigurationPolicy) -> Result<Self> {
        let pattern = policy.pattern.trim();
        match policy.object_type {
            GitObjectType::Commit => {
                if pattern.is_empty() {
                    return Err(PolicyError::invalid_pattern(&policy.pattern, "commit is empty"));
                }
                Ok(Selector::Commit(pattern.to_string()))
            }
            GitObjectType::Tag => Ok(Selector::Tag(patterns::compile(pattern)?)),
            GitObjectType::Tree if pattern == DEFAULT_BRANCH_PATTERN => Ok(Selector::DefaultBranch),
            GitObjectType::Tree => Ok(Selector::Branch(patterns::compile(pattern)?)),
        }
    }

    fn selects(&self, desc: &RefDescription) -> bool {
        match (self, desc.ref_type) {
            (Selector::Tag(glob), RefType::Tag) => glob.is_match(&desc.name),
            (Selector::DefaultBranch, RefType::Branch) => desc.is_default_branch,
            (Selector::Branch(glob), RefType::Branch) => glob.is_match(&desc.name),
            _ => false,
        }
    }
}

/// Reject policies the matcher could never evaluate.
pub fn validate_policy(policy: &ConfigurationPolicy) -> Result<()> {
    match policy.scope() {
        PolicyScope::Conflicting => return Err(PolicyError::ConflictingScope(policy.id)),
        PolicyScope::Patterns(pats) => {
            patterns::compile_all(pats)?;
        }
        PolicyScope::Repository(_) | PolicyScope::Global => {}
    }
    check_age_hours("retention_duration_hours", policy.retention_duration_hours)?;
    check_age_hours("index_commit_max_age_hours", policy.index_commit_max_age_hours)?;
    Selector::for_policy(policy).map(|_| ())
}

fn check_age_hours(field: &str, hours: Option<i64>) -> Result<()> {
    match hours {
        Some(h) if !(0..=MAX_POLICY_AGE_HOURS).contains(&h) => Err(PolicyError::InvalidMaxAge(
            format!("{} is {} hours, expected 0 to {}", field, h, MAX_POLICY_AGE_HOURS),
        )),
        _ => Ok(()),
    }
}

/// Oldest commit date a max age admits.
fn age_cutoff(now: DateTime<Utc>, age: Duration) -> Result<DateTime<Utc>> {
    if age < Duration::zero() {
        return Err(PolicyError::InvalidMaxAge(format!(
            "{} hours is negative",
            age.num_hours()
        )));
    }
    now.checked_sub_signed(age).ok_or_else(|| {
        PolicyError::InvalidMaxAge(format!(
            "{} hours reaches past the earliest representable date",
            age.num_hours()
        ))
    })
}

/// Whether a policy's repository scope includes `repository`.
pub fn policy_applies_to(policy: &ConfigurationPolicy, repository: &Repository) -> Result<bool> {
    match policy.scope() {
        PolicyScope::Repository(id) => Ok(id == repository.id),
        PolicyScope::Patterns(pats) => Ok(patterns::compile_all(pats)?
            .iter()
            .any(|glob| glob.is_match(&repository.name))),
        PolicyScope::Global => Ok(true),
        PolicyScope::Conflicting => Err(PolicyError::ConflictingScope(policy.id)),
    }
}

pub struct PolicyMatcher {
    git: Arc<dyn GitMetadataProvider>,
}

impl PolicyMatcher {
    pub fn new(git: Arc<dyn GitMetadataProvider>) -> Self {
        Self { git }
    }

    pub fn git(&self) -> &Arc<dyn GitMetadataProvider> {
        &self.git
    }

    /// Repositories a policy's scope expands to.
    pub async fn repositories_in_scope(
        &self,
        policy: &ConfigurationPolicy,
    ) -> Result<Vec<RepositoryId>> {
        match policy.scope() {
            PolicyScope::Repository(id) => Ok(vec![id]),
            PolicyScope::Patterns(pats) => {
                let globs = patterns::compile_all(pats)?;
                let repos = self.git.list_repositories().await?;
                Ok(repos
                    .into_iter()
                    .filter(|repo| globs.iter().any(|glob| glob.is_match(&repo.name)))
                    .map(|repo| repo.id)
                    .collect())
            }
            PolicyScope::Global => Ok(self
                .git
                .list_repositories()
                .await?
                .into_iter()
                .map(|repo| repo.id)
                .collect()),
            PolicyScope::Conflicting => Err(PolicyError::ConflictingScope(policy.id)),
        }
    }

    /// Every commit the policy selects across its scope, deduplicated per
    /// (repository, commit).
    pub async fn match_policy<E: Extractor + ?Sized>(
        &self,
        policy: &ConfigurationPolicy,
        extractor: &E,
        now: DateTime<Utc>,
    ) -> Result<Vec<PolicyMatch>> {
        let start = Instant::now();
        METRICS.inc_policy_evaluations();

        let selector = Selector::for_policy(policy)?;
        let limits = extractor.extract(policy);
        let mut matches = Vec::new();
        for repository_id in self.repositories_in_scope(policy).await? {
            matches.extend(
                self.match_selector(policy.id, &selector, limits, repository_id, now)
                    .await?,
            );
        }

        METRICS.add_commits_matched(matches.len() as u64);
        METRICS.record_evaluation_time(start);
        debug!(
            policy_id = policy.id,
            matches = matches.len(),
            "Evaluated policy"
        );
        Ok(matches)
    }

    /// Evaluate a policy against one repository, ignoring its scope.
    pub async fn match_in_repository<E: Extractor + ?Sized>(
        &self,
        policy: &ConfigurationPolicy,
        extractor: &E,
        repository_id: RepositoryId,
        now: DateTime<Utc>,
    ) -> Result<Vec<PolicyMatch>> {
        let selector = Selector::for_policy(policy)?;
        self.match_selector(
            policy.id,
            &selector,
            extractor.extract(policy),
            repository_id,
            now,
        )
        .await
    }

    /// Dry run of a draft policy. Validates it first and never persists anything.
    pub async fn preview_policy<E: Extractor + ?Sized>(
        &self,
        policy: &ConfigurationPolicy,
        extractor: &E,
        now: DateTime<Utc>,
    ) -> Result<Vec<PolicyMatch>> {
        validate_policy(policy)?;
        self.match_policy(policy, extractor, now).await
    }

    /// Per-commit view of which policies describe which commits of one repository.
    ///
    /// Policies whose scope excludes the repository are skipped. A policy with a
    /// configuration error is logged and skipped; provider errors abort.
    pub async fn commits_described_by_policies<F>(
        &self,
        repository: &Repository,
        policies: &[ConfigurationPolicy],
        extractor_for: F,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Vec<PolicyMatch>>>
    where
        F: Fn(&ConfigurationPolicy) -> &dyn Extractor,
    {
        let mut by_commit: BTreeMap<String, Vec<PolicyMatch>> = BTreeMap::new();
        for policy in policies {
            let result = match policy_applies_to(policy, repository) {
                Ok(false) => continue,
                Ok(true) => {
                    self.match_in_repository(policy, extractor_for(policy), repository.id, now)
                        .await
                }
                Err(err) => Err(err),
            };
            let matches = match result {
                Ok(matches) => matches,
                Err(err) if err.is_configuration_error() => {
                    METRICS.inc_policy_errors();
                    warn!(
                        policy_id = policy.id,
                        repository_id = repository.id,
                        error = %err,
                        "Skipping misconfigured policy"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            for m in matches {
                by_commit.entry(m.commit.clone()).or_default().push(m);
            }
        }
        Ok(by_commit)
    }

    /// Evaluate every policy with the facet enabled, concurrently.
    ///
    /// A failing policy is logged and reported in `failed`; the rest still run.
    pub async fn evaluate_all(
        &self,
        policies: &[ConfigurationPolicy],
        facet: Facet,
        now: DateTime<Utc>,
    ) -> EvaluationReport {
        let runs = policies
            .iter()
            .filter(|policy| facet.is_enabled(policy))
            .map(|policy| async move {
                let result = self
                    .match_policy(policy, facet.extractor_for(policy), now)
                    .await;
                (policy.id, result)
            });

        let mut report = EvaluationReport::default();
        for (policy_id, result) in join_all(runs).await {
            match result {
                Ok(matches) => report.evaluations.push(PolicyEvaluation { policy_id, matches }),
                Err(err) => {
                    METRICS.inc_policy_errors();
                    warn!(
                        policy_id,
                        facet = facet.as_str(),
                        error = %err,
                        "Policy evaluation failed"
                    );
                    report.failed.push((policy_id, err));
                }
            }
        }
        report
    }

    async fn match_selector(
        &self,
        policy_id: PolicyId,
        selector: &Selector,
        limits: FacetLimits,
        repository_id: RepositoryId,
        now: DateTime<Utc>,
    ) -> Result<Vec<PolicyMatch>> {
        let cutoff = match limits.max_age {
            Some(age) => Some(age_cutoff(now, age)?),
            None => None,
        };
        let within = |date: DateTime<Utc>| cutoff.map_or(true, |cutoff| date >= cutoff);

        let mut found: BTreeMap<String, PolicyMatch> = BTreeMap::new();
        let mut add = |commit: &str, ref_name: Option<&str>, committed_at: DateTime<Utc>| {
            if within(committed_at) {
                found
                    .entry(commit.to_string())
                    .or_insert_with(|| PolicyMatch {
                        repository_id,
                        commit: commit.to_string(),
                        ref_name: ref_name.map(str::to_string),
                        policy_id,
                        committed_at,
                    });
            }
        };

        if let Selector::Commit(commit) = selector {
            if let Some(date) = self.git.commit_date(repository_id, commit).await? {
                add(commit, None, date);
            }
            return Ok(found.into_values().collect());
        }

        let refs = self.git.ref_descriptions(repository_id).await?;
        let mut selected: Vec<(&str, &RefDescription)> = refs
            .iter()
            .flat_map(|(commit, descs)| descs.iter().map(move |d| (commit.as_str(), d)))
            .filter(|(_, desc)| selector.selects(desc))
            .collect();
        selected.sort_by(|a, b| a.1.name.cmp(&b.1.name));

        for (commit, desc) in selected {
            add(commit, Some(&desc.name), desc.created_date);

            let expand = limits.include_intermediate_commits && desc.ref_type == RefType::Branch;
            if !expand {
                continue;
            }
            let unique = self
                .git
                .commits_unique_to_branch(repository_id, &desc.name, desc.is_default_branch, cutoff)
                .await?;
            let mut unique: Vec<_> = unique.into_iter().collect();
            unique.sort();
            for (commit, date) in unique {
                add(&commit, Some(&desc.name), date);
            }
        }

        Ok(found.into_values().collect())
    }
}
