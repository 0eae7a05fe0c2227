//! Auto-indexing scheduler.
//!
//! Decides which (repository, commit) pairs get index jobs, resolves each
//! pair's job specs, and hands them to the [`IndexQueue`].

use autoindex_policies::{
    Facet, GitMetadataProvider, PolicyMatch, PolicyMatcher, ProviderError, Repository,
    METRICS as POLICY_METRICS,
};
use autoindex_protocol::{
    configuration_key, ConfigurationPolicy, ConfigurationSource, Index, IndexConfiguration,
    IndexJobHint, IndexJobSpec, IndexState, PolicyId, RepositoryId, Trigger,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::inference::{InferenceEngine, RepositoryDirectory};
use crate::metrics::METRICS;
use crate::store::{
    EnqueueOutcome, IndexQueue, NewIndex, PolicyStore, RepositoryConfigStore, ScanKind, Store,
};

/// Policy-triggered records are not re-created once the tuple settled, so a
/// terminal failure is never retried by the next scan.
const SETTLED_STATES: &[IndexState] = &[
    IndexState::Completed,
    IndexState::Errored,
    IndexState::Cancelled,
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipRefresh {
    pub evaluated: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub repositories: usize,
    pub queued: usize,
    pub coalesced: usize,
    pub failed_repositories: usize,
}

/// Dry-run result of job inference at a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredConfiguration {
    pub commit: String,
    pub jobs: Vec<IndexJobSpec>,
    pub hints: Vec<IndexJobHint>,
}

pub struct IndexScheduler {
    matcher: PolicyMatcher,
    git: Arc<dyn GitMetadataProvider>,
    inference: Arc<dyn InferenceEngine>,
    directory: Arc<dyn RepositoryDirectory>,
    policies: PolicyStore,
    queue: IndexQueue,
    configs: RepositoryConfigStore,
    config: SchedulerConfig,
}

impl IndexScheduler {
    pub fn new(
        store: &Store,
        git: Arc<dyn GitMetadataProvider>,
        inference: Arc<dyn InferenceEngine>,
        directory: Arc<dyn RepositoryDirectory>,
        config: SchedulerConfig,
    ) -> Self {
        let queue = store
            .queue()
            .with_max_retries(config.max_retries)
            .with_inference_failure_threshold(config.inference_failure_threshold)
            .with_global_policies(config.allow_global_policies);
        Self {
            matcher: PolicyMatcher::new(git.clone()),
            git,
            inference,
            directory,
            policies: store.policies(),
            queue,
            configs: store.configs(),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn queue(&self) -> &IndexQueue {
        &self.queue
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn configs(&self) -> &RepositoryConfigStore {
        &self.configs
    }

    /// Re-evaluate every policy and store which repositories each one touches.
    ///
    /// A policy's membership is the union of repositories matched under its
    /// enabled facets. Policies whose evaluation failed keep their previous
    /// membership.
    pub async fn refresh_policy_membership(&self, now: DateTime<Utc>) -> Result<MembershipRefresh> {
        let policies = self.policies.list(None).await?;
        let mut membership: BTreeMap<PolicyId, BTreeSet<RepositoryId>> = policies
            .iter()
            .filter(|policy| policy.has_effect())
            .map(|policy| (policy.id, BTreeSet::new()))
            .collect();
        let mut failed = BTreeSet::new();

        for facet in [Facet::Indexing, Facet::Retention] {
            let report = self.matcher.evaluate_all(&policies, facet, now).await;
            for evaluation in report.evaluations {
                membership
                    .entry(evaluation.policy_id)
                    .or_default()
                    .extend(evaluation.matches.iter().map(|m| m.repository_id));
            }
            failed.extend(report.failed.into_iter().map(|(policy_id, _)| policy_id));
        }

        let mut summary = MembershipRefresh::default();
        for (policy_id, repositories) in membership {
            if failed.contains(&policy_id) {
                summary.failed += 1;
                continue;
            }
            summary.evaluated += 1;
            if self
                .policies
                .replace_membership(policy_id, &repositories)
                .await?
            {
                POLICY_METRICS.inc_policies_updated();
                summary.updated += 1;
                info!(
                    policy_id,
                    repositories = repositories.len(),
                    "Policy membership changed"
                );
            }
        }
        Ok(summary)
    }

    /// One automatic scheduling pass over repositories due for an indexing scan.
    pub async fn schedule_cycle(&self, now: DateTime<Utc>) -> Result<CycleSummary> {
        let start = Instant::now();
        METRICS.inc_scheduler_cycles();

        let due = self
            .queue
            .repositories_due_for_scan(
                ScanKind::Indexing,
                self.config.scan_min_delay(),
                self.config.scan_batch_size,
                now,
            )
            .await?;
        let mut summary = CycleSummary {
            repositories: due.len(),
            ..CycleSummary::default()
        };
        if due.is_empty() {
            METRICS.record_cycle_time(start);
            return Ok(summary);
        }

        let policies = self.policies.list(Some(Facet::Indexing)).await?;
        for repository_id in due {
            match self.schedule_repository(repository_id, &policies, now).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        if outcome.coalesced {
                            summary.coalesced += 1;
                        } else {
                            summary.queued += 1;
                        }
                    }
                }
                Err(err) => {
                    METRICS.inc_repository_errors();
                    summary.failed_repositories += 1;
                    warn!(repository_id, error = %err, "Failed to schedule repository");
                }
            }
        }

        METRICS.record_cycle_time(start);
        info!(
            repositories = summary.repositories,
            queued = summary.queued,
            coalesced = summary.coalesced,
            failed = summary.failed_repositories,
            "Scheduling cycle finished"
        );
        Ok(summary)
    }

    async fn schedule_repository(
        &self,
        repository_id: RepositoryId,
        policies: &[ConfigurationPolicy],
        now: DateTime<Utc>,
    ) -> Result<Vec<EnqueueOutcome>> {
        let repository = self.repository(repository_id).await?;
        let described = self
            .matcher
            .commits_described_by_policies(
                &repository,
                policies,
                |policy| Facet::Indexing.extractor_for(policy),
                now,
            )
            .await?;

        let mut outcomes = Vec::new();
        for (commit, matches) in described {
            let policy_id = matches.first().map(|m: &PolicyMatch| m.policy_id);
            outcomes.extend(
                self.queue_indexes_for_commit(
                    &repository,
                    &commit,
                    None,
                    Trigger::Policy,
                    policy_id,
                    false,
                    now,
                )
                .await?,
            );
        }
        Ok(outcomes)
    }

    /// Manually queue indexing of `revision`.
    ///
    /// Bypasses inference suppression and clears the failure streak on
    /// success. Unless `force` is set, jobs already completed for the same
    /// (repository, commit, configuration) are skipped.
    pub async fn queue_indexes(
        &self,
        repository_id: RepositoryId,
        revision: &str,
        configuration_override: Option<&str>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Index>> {
        let repository = self.repository(repository_id).await?;
        let commit = self.resolve_revision(repository_id, revision).await?;

        let outcomes = self
            .queue_indexes_for_commit(
                &repository,
                &commit,
                configuration_override,
                Trigger::Manual,
                None,
                force,
                now,
            )
            .await?;
        self.queue.reset_inference_failures(repository_id).await?;
        Ok(outcomes.into_iter().map(|outcome| outcome.index).collect())
    }

    /// Resolve job specs for a commit and enqueue them.
    #[allow(clippy::too_many_arguments)]
    pub async fn queue_indexes_for_commit(
        &self,
        repository: &Repository,
        commit: &str,
        configuration_override: Option<&str>,
        trigger: Trigger,
        policy_id: Option<PolicyId>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<EnqueueOutcome>> {
        let (source, jobs) = self
            .resolve_jobs(repository, commit, configuration_override, now)
            .await?;
        if jobs.is_empty() {
            info!(
                repository_id = repository.id,
                commit,
                source = source.as_str(),
                "No index jobs for commit"
            );
            return Ok(Vec::new());
        }

        let skip_states: &[IndexState] = match (trigger, force) {
            (_, true) => &[],
            (Trigger::Policy, false) => SETTLED_STATES,
            (Trigger::Manual, false) => &[IndexState::Completed],
        };

        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            let configuration = configuration_key(source, &job);
            if self
                .queue
                .has_record_in_states(repository.id, commit, &configuration, skip_states)
                .await?
            {
                debug!(
                    repository_id = repository.id,
                    commit,
                    configuration = %configuration,
                    "Skipping job already indexed"
                );
                continue;
            }

            let new = NewIndex {
                repository_id: repository.id,
                repository_name: repository.name.clone(),
                commit: commit.to_string(),
                configuration,
                job,
                trigger,
                policy_id,
            };
            outcomes.push(self.queue.enqueue(&new, now).await?);
        }
        Ok(outcomes)
    }

    /// Jobs and hints inference would produce at `revision`. Persists nothing.
    pub async fn infer_index_configuration(
        &self,
        repository_id: RepositoryId,
        revision: &str,
    ) -> Result<InferredConfiguration> {
        let repository = self.repository(repository_id).await?;
        let commit = self.resolve_revision(repository_id, revision).await?;
        let script = self.inference_script().await?;

        let jobs = self
            .inference
            .infer_index_jobs(&repository, &commit, script.as_deref())
            .await?;
        let hints = self
            .inference
            .infer_index_job_hints(&repository, &commit, script.as_deref())
            .await?;
        Ok(InferredConfiguration { commit, jobs, hints })
    }

    /// Matches a draft policy would produce for `facet`, without persisting.
    pub async fn preview_policy(
        &self,
        policy: &ConfigurationPolicy,
        facet: Facet,
        now: DateTime<Utc>,
    ) -> Result<Vec<PolicyMatch>> {
        Ok(self
            .matcher
            .preview_policy(policy, facet.extractor_for(policy), now)
            .await?)
    }

    /// Override text, then stored configuration, then inference.
    async fn resolve_jobs(
        &self,
        repository: &Repository,
        commit: &str,
        configuration_override: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(ConfigurationSource, Vec<IndexJobSpec>)> {
        if let Some(text) = configuration_override {
            let config = IndexConfiguration::parse(text)
                .map_err(|e| SchedulerError::InvalidConfiguration(e.to_string()))?;
            return Ok((ConfigurationSource::Override, config.index_jobs));
        }

        if let Some(config) = self.configs.get(repository.id).await? {
            return Ok((ConfigurationSource::Stored, config.index_jobs));
        }

        let script = self.inference_script().await?;
        match self
            .inference
            .infer_index_jobs(repository, commit, script.as_deref())
            .await
        {
            Ok(jobs) => {
                self.queue
                    .record_inference_success(repository.id, now)
                    .await?;
                Ok((ConfigurationSource::Inferred, jobs))
            }
            Err(err) => {
                let failures = self
                    .queue
                    .record_inference_failure(repository.id, &err.to_string(), now)
                    .await?;
                warn!(
                    repository_id = repository.id,
                    commit,
                    failures,
                    error = %err,
                    "Index job inference failed"
                );
                Err(err.into())
            }
        }
    }

    async fn inference_script(&self) -> Result<Option<String>> {
        Ok(self
            .configs
            .inference_script()
            .await?
            .filter(|script| !script.trim().is_empty()))
    }

    async fn repository(&self, repository_id: RepositoryId) -> Result<Repository> {
        self.directory
            .get(repository_id)
            .await?
            .ok_or(SchedulerError::RepositoryNotFound(repository_id))
    }

    /// Resolve a revision; an unknown revision also asks for a repository refresh.
    async fn resolve_revision(&self, repository_id: RepositoryId, revision: &str) -> Result<String> {
        match self.git.resolve_revision(repository_id, revision).await {
            Ok(commit) => Ok(commit),
            Err(err @ ProviderError::RevisionNotFound { .. }) => {
                if let Err(refresh_err) = self.directory.enqueue_refresh(repository_id).await {
                    warn!(repository_id, error = %refresh_err, "Failed to request repository refresh");
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}
