//! Configuration policy persistence and the policy/repository membership cache.

use autoindex_policies::{validate_policy, Facet};
use autoindex_protocol::{ConfigurationPolicy, PolicyId, RepositoryId};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeSet;
use tracing::info;

use super::to_db_time;
use crate::error::{StoreError, StoreResult};

const POLICY_COLUMNS: &str = "id, name, protected, repository_id, repository_patterns, \
     object_type, pattern, retention_enabled, retention_duration_hours, \
     retain_intermediate_commits, indexing_enabled, index_commit_max_age_hours, \
     index_intermediate_commits";

#[derive(Clone)]
pub struct PolicyStore {
    pool: Pool<Sqlite>,
}

impl PolicyStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert a policy; `policy.id` is ignored and the stored policy returned.
    ///
    /// A global policy (no scope fields) is accepted only when it is protected
    /// or `allow_global` is set.
    pub async fn create(
        &self,
        policy: &ConfigurationPolicy,
        allow_global: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<ConfigurationPolicy> {
        validate(policy, allow_global)?;
        let ts = to_db_time(now);
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO configuration_policies (
                name, protected, repository_id, repository_patterns, object_type, pattern,
                retention_enabled, retention_duration_hours, retain_intermediate_commits,
                indexing_enabled, index_commit_max_age_hours, index_intermediate_commits,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&policy.name)
        .bind(policy.protected)
        .bind(policy.repository_id)
        .bind(patterns_json(policy)?)
        .bind(policy.object_type.as_str())
        .bind(&policy.pattern)
        .bind(policy.retention_enabled)
        .bind(policy.retention_duration_hours)
        .bind(policy.retain_intermediate_commits)
        .bind(policy.indexing_enabled)
        .bind(policy.index_commit_max_age_hours)
        .bind(policy.index_intermediate_commits)
        .bind(&ts)
        .bind(&ts)
        .fetch_one(&self.pool)
        .await?;

        info!(policy_id = id, name = %policy.name, "Created configuration policy");
        Ok(ConfigurationPolicy {
            id,
            ..policy.clone()
        })
    }

    /// Replace every user-editable field. The `protected` flag never changes.
    pub async fn update(
        &self,
        policy: &ConfigurationPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<ConfigurationPolicy> {
        let existing = self
            .get(policy.id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("policy {}", policy.id)))?;
        if existing.protected {
            return Err(StoreError::Protected(policy.id));
        }
        let editable = ConfigurationPolicy {
            protected: false,
            ..policy.clone()
        };
        validate(&editable, existing.is_global())?;

        sqlx::query(
            r#"
            UPDATE configuration_policies
            SET name = ?, repository_id = ?, repository_patterns = ?, object_type = ?,
                pattern = ?, retention_enabled = ?, retention_duration_hours = ?,
                retain_intermediate_commits = ?, indexing_enabled = ?,
                index_commit_max_age_hours = ?, index_intermediate_commits = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&policy.name)
        .bind(policy.repository_id)
        .bind(patterns_json(policy)?)
        .bind(policy.object_type.as_str())
        .bind(&policy.pattern)
        .bind(policy.retention_enabled)
        .bind(policy.retention_duration_hours)
        .bind(policy.retain_intermediate_commits)
        .bind(policy.indexing_enabled)
        .bind(policy.index_commit_max_age_hours)
        .bind(policy.index_intermediate_commits)
        .bind(to_db_time(now))
        .bind(policy.id)
        .execute(&self.pool)
        .await?;

        info!(policy_id = policy.id, "Updated configuration policy");
        Ok(editable)
    }

    pub async fn delete(&self, id: PolicyId) -> StoreResult<()> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("policy {}", id)))?;
        if existing.protected {
            return Err(StoreError::Protected(id));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM policy_repository_membership WHERE policy_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM configuration_policies WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(policy_id = id, "Deleted configuration policy");
        Ok(())
    }

    pub async fn get(&self, id: PolicyId) -> StoreResult<Option<ConfigurationPolicy>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM configuration_policies WHERE id = ?",
            POLICY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    /// All policies, or only those with `facet` enabled.
    pub async fn list(&self, facet: Option<Facet>) -> StoreResult<Vec<ConfigurationPolicy>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM configuration_policies ORDER BY id",
            POLICY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut policies = Vec::with_capacity(rows.len());
        for row in &rows {
            let policy = policy_from_row(row)?;
            if facet.map_or(true, |facet| facet.is_enabled(&policy)) {
                policies.push(policy);
            }
        }
        Ok(policies)
    }

    /// Swap in a policy's repository set. Returns true when it changed.
    pub async fn replace_membership(
        &self,
        policy_id: PolicyId,
        repositories: &BTreeSet<RepositoryId>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let current: BTreeSet<RepositoryId> = sqlx::query_scalar(
            "SELECT repository_id FROM policy_repository_membership WHERE policy_id = ?",
        )
        .bind(policy_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();

        if &current == repositories {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM policy_repository_membership WHERE policy_id = ?")
            .bind(policy_id)
            .execute(&mut *tx)
            .await?;
        for repository_id in repositories {
            sqlx::query(
                "INSERT INTO policy_repository_membership (policy_id, repository_id) VALUES (?, ?)",
            )
            .bind(policy_id)
            .bind(repository_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    pub async fn membership(&self, policy_id: PolicyId) -> StoreResult<BTreeSet<RepositoryId>> {
        let ids: Vec<RepositoryId> = sqlx::query_scalar(
            "SELECT repository_id FROM policy_repository_membership WHERE policy_id = ?",
        )
        .bind(policy_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn policies_for_repository(
        &self,
        repository_id: RepositoryId,
    ) -> StoreResult<Vec<PolicyId>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT policy_id FROM policy_repository_membership
            WHERE repository_id = ?
            ORDER BY policy_id
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn validate(policy: &ConfigurationPolicy, allow_global: bool) -> StoreResult<()> {
    if policy.name.trim().is_empty() {
        return Err(StoreError::Validation("name is empty".to_string()));
    }
    if !policy.has_effect() {
        return Err(StoreError::Validation(
            "neither retention nor indexing is enabled".to_string(),
        ));
    }
    validate_policy(policy)?;
    if policy.is_global() && !(policy.protected || allow_global) {
        return Err(StoreError::Validation(
            "global policies require an explicit opt-in".to_string(),
        ));
    }
    Ok(())
}

fn patterns_json(policy: &ConfigurationPolicy) -> StoreResult<Option<String>> {
    Ok(policy
        .repository_patterns
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?)
}

fn policy_from_row(row: &SqliteRow) -> StoreResult<ConfigurationPolicy> {
    let patterns: Option<String> = row.try_get("repository_patterns")?;
    let object_type: String = row.try_get("object_type")?;
    Ok(ConfigurationPolicy {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        protected: row.try_get("protected")?,
        repository_id: row.try_get("repository_id")?,
        repository_patterns: patterns
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        object_type: object_type.parse().map_err(StoreError::Corrupt)?,
        pattern: row.try_get("pattern")?,
        retention_enabled: row.try_get("retention_enabled")?,
        retention_duration_hours: row.try_get("retention_duration_hours")?,
        retain_intermediate_commits: row.try_get("retain_intermediate_commits")?,
        indexing_enabled: row.try_get("indexing_enabled")?,
        index_commit_max_age_hours: row.try_get("index_commit_max_age_hours")?,
        index_intermediate_commits: row.try_get("index_intermediate_commits")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use autoindex_policies::PolicyError;
    use autoindex_protocol::GitObjectType;

    fn draft() -> ConfigurationPolicy {
        ConfigurationPolicy {
            id: 0,
            name: "main branch".to_string(),
            protected: false,
            repository_id: None,
            repository_patterns: Some(vec!["github.com/acme/*".to_string()]),
            object_type: GitObjectType::Tree,
            pattern: "HEAD".to_string(),
            retention_enabled: false,
            retention_duration_hours: None,
            retain_intermediate_commits: false,
            indexing_enabled: true,
            index_commit_max_age_hours: Some(24),
            index_intermediate_commits: false,
        }
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let store = Store::open_in_memory().await.unwrap();
        let policies = store.policies();
        let created = policies.create(&draft(), false, Utc::now()).await.unwrap();
        assert!(created.id > 0);

        let fetched = policies.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(policies.list(Some(Facet::Indexing)).await.unwrap().len(), 1);
        assert!(policies.list(Some(Facet::Retention)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_time_validation() {
        let store = Store::open_in_memory().await.unwrap();
        let policies = store.policies();

        let mut conflicting = draft();
        conflicting.repository_id = Some(4);
        assert!(matches!(
            policies.create(&conflicting, false, Utc::now()).await,
            Err(StoreError::InvalidPolicy(_))
        ));

        let mut bad_glob = draft();
        bad_glob.object_type = GitObjectType::Tag;
        bad_glob.pattern = "v[".to_string();
        assert!(policies.create(&bad_glob, false, Utc::now()).await.is_err());

        let mut inert = draft();
        inert.indexing_enabled = false;
        assert!(matches!(
            policies.create(&inert, false, Utc::now()).await,
            Err(StoreError::Validation(_))
        ));

        let mut negative_age = draft();
        negative_age.retention_enabled = true;
        negative_age.retention_duration_hours = Some(-1);
        assert!(matches!(
            policies.create(&negative_age, false, Utc::now()).await,
            Err(StoreError::InvalidPolicy(PolicyError::InvalidMaxAge(_)))
        ));

        let mut ancient = draft();
        ancient.index_commit_max_age_hours = Some(10_000_000_000);
        assert!(matches!(
            policies.create(&ancient, false, Utc::now()).await,
            Err(StoreError::InvalidPolicy(PolicyError::InvalidMaxAge(_)))
        ));
        assert!(policies.list(None).await.unwrap().is_empty());

        let mut global = draft();
        global.repository_patterns = None;
        assert!(policies.create(&global, false, Utc::now()).await.is_err());
        assert!(policies.create(&global, true, Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_protected_policies_are_immutable() {
        let store = Store::open_in_memory().await.unwrap();
        let policies = store.policies();
        let mut system = draft();
        system.protected = true;
        system.repository_patterns = None;
        let created = policies.create(&system, false, Utc::now()).await.unwrap();

        let mut edit = created.clone();
        edit.name = "renamed".to_string();
        assert!(matches!(
            policies.update(&edit, Utc::now()).await,
            Err(StoreError::Protected(_))
        ));
        assert!(matches!(
            policies.delete(created.id).await,
            Err(StoreError::Protected(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = Store::open_in_memory().await.unwrap();
        let policies = store.policies();
        let created = policies.create(&draft(), false, Utc::now()).await.unwrap();

        let mut edit = created.clone();
        edit.pattern = "release/*".to_string();
        policies.update(&edit, Utc::now()).await.unwrap();
        assert_eq!(
            policies.get(created.id).await.unwrap().unwrap().pattern,
            "release/*"
        );

        policies
            .replace_membership(created.id, &BTreeSet::from([1, 2]))
            .await
            .unwrap();
        policies.delete(created.id).await.unwrap();
        assert!(policies.get(created.id).await.unwrap().is_none());
        assert!(policies.membership(created.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_membership_reports_changes() {
        let store = Store::open_in_memory().await.unwrap();
        let policies = store.policies();
        let id = policies.create(&draft(), false, Utc::now()).await.unwrap().id;

        assert!(policies
            .replace_membership(id, &BTreeSet::from([1, 2]))
            .await
            .unwrap());
        assert!(!policies
            .replace_membership(id, &BTreeSet::from([2, 1]))
            .await
            .unwrap());
        assert!(policies
            .replace_membership(id, &BTreeSet::from([3]))
            .await
            .unwrap());
        assert_eq!(policies.policies_for_repository(3).await.unwrap(), vec![id]);
        assert!(policies.policies_for_repository(1).await.unwrap().is_empty());
    }
}
