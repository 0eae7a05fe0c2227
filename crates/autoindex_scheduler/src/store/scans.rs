//! Scan bookkeeping and inference backpressure, kept per repository.

use autoindex_protocol::RepositoryId;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use tracing::{debug, warn};

use super::queue::IndexQueue;
use super::{from_db_time_opt, to_db_time};
use crate::error::StoreResult;
use crate::metrics::METRICS;

/// Which periodic scan a due-query is for. Each kind has its own timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    Indexing,
    Retention,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Indexing => "indexing",
            ScanKind::Retention => "retention",
        }
    }

    fn scan_column(&self) -> &'static str {
        match self {
            ScanKind::Indexing => "last_index_scan_at",
            ScanKind::Retention => "last_retention_scan_at",
        }
    }

    fn facet_column(&self) -> &'static str {
        match self {
            ScanKind::Indexing => "indexing_enabled",
            ScanKind::Retention => "retention_enabled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryScan {
    pub repository_id: RepositoryId,
    pub last_index_scan_at: Option<DateTime<Utc>>,
    pub last_retention_scan_at: Option<DateTime<Utc>>,
    pub consecutive_inference_failures: i32,
    pub last_inference_error: Option<String>,
    pub last_inference_attempt_at: Option<DateTime<Utc>>,
}

impl IndexQueue {
    /// Claim up to `limit` repositories due for a scan of `kind`.
    ///
    /// Candidates are repositories in the membership of at least one policy
    /// with the matching facet enabled. Global policies count only when the
    /// queue was built `with_global_policies(true)`. A repository is due when it was never
    /// scanned or its last scan is at least `min_delay` old; never-scanned
    /// repositories come first, then oldest scan, then id. Each returned
    /// repository has had its scan timestamp moved to `now` by a conditional
    /// upsert, so concurrent callers never receive the same repository within
    /// the window. Indexing scans skip repositories whose inference is
    /// suppressed.
    pub async fn repositories_due_for_scan(
        &self,
        kind: ScanKind,
        min_delay: Duration,
        limit: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RepositoryId>> {
        let cutoff = to_db_time(now - min_delay);
        let threshold = match kind {
            ScanKind::Indexing => self.inference_failure_threshold,
            ScanKind::Retention => 0,
        };
        let column = kind.scan_column();

        let candidates: Vec<RepositoryId> = sqlx::query_scalar(&format!(
            r#"
            SELECT m.repository_id
            FROM (
                SELECT DISTINCT pm.repository_id
                FROM policy_repository_membership pm
                JOIN configuration_policies p ON p.id = pm.policy_id
                WHERE p.{facet} = 1
                  AND (? OR p.repository_id IS NOT NULL OR p.repository_patterns IS NOT NULL)
            ) m
            LEFT JOIN repository_scans s ON s.repository_id = m.repository_id
            WHERE (s.{column} IS NULL OR s.{column} <= ?)
              AND (? <= 0 OR COALESCE(s.consecutive_inference_failures, 0) < ?)
            ORDER BY s.{column} IS NOT NULL, s.{column}, m.repository_id
            LIMIT ?
            "#,
            facet = kind.facet_column(),
            column = column,
        ))
        .bind(self.global_policies)
        .bind(&cutoff)
        .bind(threshold)
        .bind(threshold)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let stamp = to_db_time(now);
        let mut claimed = Vec::with_capacity(candidates.len());
        for repository_id in candidates {
            let updated = sqlx::query(&format!(
                r#"
                INSERT INTO repository_scans (repository_id, {column}) VALUES (?, ?)
                ON CONFLICT(repository_id) DO UPDATE SET {column} = excluded.{column}
                WHERE repository_scans.{column} IS NULL OR repository_scans.{column} <= ?
                "#,
                column = column,
            ))
            .bind(repository_id)
            .bind(&stamp)
            .bind(&cutoff)
            .execute(self.pool())
            .await?
            .rows_affected();

            if updated > 0 {
                claimed.push(repository_id);
            }
        }

        METRICS.add_repositories_scanned(claimed.len() as u64);
        debug!(
            kind = kind.as_str(),
            due = claimed.len(),
            "Claimed repositories due for scan"
        );
        Ok(claimed)
    }

    /// Count a failed inference attempt; returns the new consecutive count.
    pub async fn record_inference_failure(
        &self,
        repository_id: RepositoryId,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<i32> {
        let failures: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO repository_scans (
                repository_id, consecutive_inference_failures, last_inference_error,
                last_inference_attempt_at
            ) VALUES (?, 1, ?, ?)
            ON CONFLICT(repository_id) DO UPDATE SET
                consecutive_inference_failures = repository_scans.consecutive_inference_failures + 1,
                last_inference_error = excluded.last_inference_error,
                last_inference_attempt_at = excluded.last_inference_attempt_at
            RETURNING consecutive_inference_failures
            "#,
        )
        .bind(repository_id)
        .bind(error)
        .bind(to_db_time(now))
        .fetch_one(self.pool())
        .await?;

        METRICS.inc_inference_failures();
        if failures == self.inference_failure_threshold {
            warn!(
                repository_id,
                failures, "Inference keeps failing; automatic scheduling suppressed"
            );
        }
        Ok(failures)
    }

    pub async fn record_inference_success(
        &self,
        repository_id: RepositoryId,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO repository_scans (
                repository_id, consecutive_inference_failures, last_inference_attempt_at
            ) VALUES (?, 0, ?)
            ON CONFLICT(repository_id) DO UPDATE SET
                consecutive_inference_failures = 0,
                last_inference_error = NULL,
                last_inference_attempt_at = excluded.last_inference_attempt_at
            "#,
        )
        .bind(repository_id)
        .bind(to_db_time(now))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Clear the failure streak without recording an attempt.
    pub async fn reset_inference_failures(&self, repository_id: RepositoryId) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE repository_scans
            SET consecutive_inference_failures = 0, last_inference_error = NULL
            WHERE repository_id = ?
            "#,
        )
        .bind(repository_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// True once consecutive failures reached the configured threshold.
    /// A threshold of zero disables suppression.
    pub async fn is_inference_suppressed(&self, repository_id: RepositoryId) -> StoreResult<bool> {
        if self.inference_failure_threshold <= 0 {
            return Ok(false);
        }
        let failures: Option<i32> = sqlx::query_scalar(
            "SELECT consecutive_inference_failures FROM repository_scans WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(failures.unwrap_or(0) >= self.inference_failure_threshold)
    }

    pub async fn scan_state(&self, repository_id: RepositoryId) -> StoreResult<Option<RepositoryScan>> {
        let row = sqlx::query("SELECT * FROM repository_scans WHERE repository_id = ?")
            .bind(repository_id)
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(RepositoryScan {
            repository_id,
            last_index_scan_at: from_db_time_opt(row.try_get("last_index_scan_at")?)?,
            last_retention_scan_at: from_db_time_opt(row.try_get("last_retention_scan_at")?)?,
            consecutive_inference_failures: row.try_get("consecutive_inference_failures")?,
            last_inference_error: row.try_get("last_inference_error")?,
            last_inference_attempt_at: from_db_time_opt(row.try_get("last_inference_attempt_at")?)?,
        }))
    }
}
