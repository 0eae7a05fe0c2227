//! Schema creation. All CREATE statements live here.

use tracing::debug;

use super::Store;
use crate::error::StoreResult;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS configuration_policies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        protected INTEGER NOT NULL DEFAULT 0,
        repository_id INTEGER,
        repository_patterns TEXT,
        object_type TEXT NOT NULL,
        pattern TEXT NOT NULL,
        retention_enabled INTEGER NOT NULL DEFAULT 0,
        retention_duration_hours INTEGER,
        retain_intermediate_commits INTEGER NOT NULL DEFAULT 0,
        indexing_enabled INTEGER NOT NULL DEFAULT 0,
        index_commit_max_age_hours INTEGER,
        index_intermediate_commits INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS policy_repository_membership (
        policy_id INTEGER NOT NULL REFERENCES configuration_policies(id) ON DELETE CASCADE,
        repository_id INTEGER NOT NULL,
        PRIMARY KEY (policy_id, repository_id)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS ix_membership_repository
        ON policy_repository_membership(repository_id)"#,
    r#"CREATE TABLE IF NOT EXISTS indexes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL,
        repository_name TEXT NOT NULL,
        commit_sha TEXT NOT NULL,
        configuration TEXT NOT NULL,
        job TEXT NOT NULL,
        trigger_kind TEXT NOT NULL,
        policy_id INTEGER,
        state TEXT NOT NULL DEFAULT 'queued',
        queued_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        last_heartbeat_at TEXT,
        worker_id TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        failure_message TEXT,
        failure_category TEXT,
        execution_log TEXT,
        cancel_requested INTEGER NOT NULL DEFAULT 0
    )"#,
    // At most one non-terminal record per (repository, commit, configuration).
    r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_indexes_active
        ON indexes(repository_id, commit_sha, configuration)
        WHERE state IN ('queued', 'processing')"#,
    r#"CREATE INDEX IF NOT EXISTS ix_indexes_claim
        ON indexes(state, queued_at, id)"#,
    r#"CREATE INDEX IF NOT EXISTS ix_indexes_repository
        ON indexes(repository_id, commit_sha)"#,
    r#"CREATE TABLE IF NOT EXISTS repository_scans (
        repository_id INTEGER PRIMARY KEY,
        last_index_scan_at TEXT,
        last_retention_scan_at TEXT,
        consecutive_inference_failures INTEGER NOT NULL DEFAULT 0,
        last_inference_error TEXT,
        last_inference_attempt_at TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS repository_index_configurations (
        repository_id INTEGER PRIMARY KEY,
        configuration TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS inference_scripts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        script TEXT NOT NULL,
        inserted_at TEXT NOT NULL
    )"#,
];

impl Store {
    /// Create every table and index. Safe to run repeatedly.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(self.pool())
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(self.pool()).await?;
        }
        debug!("State store schema verified");
        Ok(())
    }
}
