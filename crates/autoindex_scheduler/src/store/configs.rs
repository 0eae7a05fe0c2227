//! Stored per-repository index configuration and the global inference script.

use autoindex_protocol::{IndexConfiguration, RepositoryId};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use tracing::info;

use super::to_db_time;
use crate::error::StoreResult;

#[derive(Clone)]
pub struct RepositoryConfigStore {
    pool: Pool<Sqlite>,
}

impl RepositoryConfigStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn get(&self, repository_id: RepositoryId) -> StoreResult<Option<IndexConfiguration>> {
        let text: Option<String> = sqlx::query_scalar(
            "SELECT configuration FROM repository_index_configurations WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(text.as_deref().map(IndexConfiguration::parse).transpose()?)
    }

    pub async fn set(
        &self,
        repository_id: RepositoryId,
        configuration: &IndexConfiguration,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO repository_index_configurations (repository_id, configuration, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(repository_id) DO UPDATE SET
                configuration = excluded.configuration,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(repository_id)
        .bind(serde_json::to_string(configuration)?)
        .bind(to_db_time(now))
        .execute(&self.pool)
        .await?;
        info!(
            repository_id,
            jobs = configuration.index_jobs.len(),
            "Stored index configuration"
        );
        Ok(())
    }

    /// Returns false when nothing was stored.
    pub async fn delete(&self, repository_id: RepositoryId) -> StoreResult<bool> {
        let deleted =
            sqlx::query("DELETE FROM repository_index_configurations WHERE repository_id = ?")
                .bind(repository_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(deleted > 0)
    }

    /// The most recently stored inference script, if any.
    pub async fn inference_script(&self) -> StoreResult<Option<String>> {
        let script = sqlx::query_scalar(
            "SELECT script FROM inference_scripts ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(script)
    }

    /// Store a new inference script. An empty script clears the override.
    pub async fn set_inference_script(&self, script: &str, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("INSERT INTO inference_scripts (script, inserted_at) VALUES (?, ?)")
            .bind(script)
            .bind(to_db_time(now))
            .execute(&self.pool)
            .await?;
        info!(bytes = script.len(), "Stored inference script");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use autoindex_protocol::IndexJobSpec;

    #[tokio::test]
    async fn test_configuration_roundtrip_and_replace() {
        let store = Store::open_in_memory().await.unwrap();
        let configs = store.configs();
        assert!(configs.get(7).await.unwrap().is_none());

        let mut config = IndexConfiguration {
            index_jobs: vec![IndexJobSpec {
                indexer: "scip-go".to_string(),
                steps: vec![],
                indexer_args: vec!["scip-go".to_string()],
                root: String::new(),
                outfile: String::new(),
                local_steps: vec![],
                requested_env_vars: vec![],
            }],
        };
        configs.set(7, &config, Utc::now()).await.unwrap();
        config.index_jobs[0].root = "cmd".to_string();
        configs.set(7, &config, Utc::now()).await.unwrap();

        assert_eq!(configs.get(7).await.unwrap(), Some(config));
        assert!(configs.delete(7).await.unwrap());
        assert!(!configs.delete(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_inference_script_wins() {
        let store = Store::open_in_memory().await.unwrap();
        let configs = store.configs();
        assert_eq!(configs.inference_script().await.unwrap(), None);
        configs.set_inference_script("return {}", Utc::now()).await.unwrap();
        configs.set_inference_script("return {go}", Utc::now()).await.unwrap();
        assert_eq!(
            configs.inference_script().await.unwrap().as_deref(),
            Some("return {go}")
        );
    }
}
