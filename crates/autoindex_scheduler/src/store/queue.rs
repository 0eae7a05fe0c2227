//! Index queue.
//!
//! Every state transition is a single conditional `UPDATE ... RETURNING`, so
//! concurrent workers and schedulers never observe a record in two states and
//! a record is never claimed twice.

use autoindex_protocol::defaults::{
    CANCELLED_BY_USER_MESSAGE, DEFAULT_INFERENCE_FAILURE_THRESHOLD, DEFAULT_MAX_RETRIES,
    MAX_EXECUTION_LOG_BYTES,
};
use autoindex_protocol::{
    log_tail, FailureCategory, Index, IndexId, IndexJobSpec, IndexState, PolicyId, RepositoryId,
    Trigger,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, warn};

use super::{from_db_time, from_db_time_opt, to_db_time};
use crate::error::{StoreError, StoreResult};
use crate::metrics::METRICS;

const ENQUEUE_ATTEMPTS: usize = 3;
const DEFAULT_LIST_LIMIT: i64 = 100;

/// Request to create an index record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIndex {
    pub repository_id: RepositoryId,
    pub repository_name: String,
    pub commit: String,
    pub configuration: String,
    pub job: IndexJobSpec,
    pub trigger: Trigger,
    pub policy_id: Option<PolicyId>,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub index: Index,
    /// True when an existing non-terminal record was returned instead of a new one.
    pub coalesced: bool,
}

/// What a worker reports for a record it claimed.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        execution_log: Option<String>,
    },
    /// Goes back to `queued` while retries remain.
    RetryableFailure {
        message: String,
        category: FailureCategory,
        execution_log: Option<String>,
    },
    /// Never retried automatically.
    TerminalFailure {
        message: String,
        category: FailureCategory,
        execution_log: Option<String>,
    },
    Cancelled {
        message: String,
        execution_log: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Records still processing under this worker.
    pub known: Vec<IndexId>,
    /// Subset of `known` whose cancellation was requested.
    pub cancel: Vec<IndexId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimSummary {
    pub requeued: Vec<IndexId>,
    pub errored: Vec<IndexId>,
    pub cancelled: Vec<IndexId>,
}

impl ReclaimSummary {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.errored.len() + self.cancelled.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    pub repository_id: Option<RepositoryId>,
    pub commit: Option<String>,
    pub state: Option<IndexState>,
    /// Defaults to 100.
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueStats {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub errored: i64,
    pub cancelled: i64,
}

#[derive(Clone)]
pub struct IndexQueue {
    pool: Pool<Sqlite>,
    max_retries: i32,
    pub(crate) inference_failure_threshold: i32,
    pub(crate) global_policies: bool,
}

impl IndexQueue {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            max_retries: DEFAULT_MAX_RETRIES,
            inference_failure_threshold: DEFAULT_INFERENCE_FAILURE_THRESHOLD,
            global_policies: false,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_inference_failure_threshold(mut self, threshold: i32) -> Self {
        self.inference_failure_threshold = threshold;
        self
    }

    /// Let global policies (no repository scope) nominate repositories for scans.
    pub fn with_global_policies(mut self, enabled: bool) -> Self {
        self.global_policies = enabled;
        self
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Create a queued record, or return the pending one for the same
    /// (repository, commit, configuration).
    pub async fn enqueue(&self, new: &NewIndex, now: DateTime<Utc>) -> StoreResult<EnqueueOutcome> {
        let job = serde_json::to_string(&new.job)?;
        let queued_at = to_db_time(now);

        // The active record can turn terminal between the failed insert and
        // the lookup; retry the insert in that case.
        for _ in 0..ENQUEUE_ATTEMPTS {
            let inserted = sqlx::query(
                r#"
                INSERT INTO indexes (
                    repository_id, repository_name, commit_sha, configuration, job,
                    trigger_kind, policy_id, state, queued_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', ?)
                ON CONFLICT DO NOTHING
                RETURNING *
                "#,
            )
            .bind(new.repository_id)
            .bind(&new.repository_name)
            .bind(&new.commit)
            .bind(&new.configuration)
            .bind(&job)
            .bind(new.trigger.as_str())
            .bind(new.policy_id)
            .bind(&queued_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = inserted {
                let index = index_from_row(&row)?;
                METRICS.inc_indexes_enqueued();
                info!(
                    index_id = index.id,
                    repository_id = index.repository_id,
                    commit = %index.commit,
                    configuration = %index.configuration,
                    trigger = %index.trigger,
                    "Queued index"
                );
                return Ok(EnqueueOutcome {
                    index,
                    coalesced: false,
                });
            }

            if let Some(index) = self
                .active_for(new.repository_id, &new.commit, &new.configuration)
                .await?
            {
                METRICS.inc_indexes_coalesced();
                debug!(
                    index_id = index.id,
                    state = %index.state,
                    "Coalesced with pending index"
                );
                return Ok(EnqueueOutcome {
                    index,
                    coalesced: true,
                });
            }
        }

        Err(StoreError::invalid_state(format!(
            "could not enqueue {}@{} ({})",
            new.repository_id, new.commit, new.configuration
        )))
    }

    /// Atomically move the oldest queued record to `processing` for `worker_id`.
    pub async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> StoreResult<Option<Index>> {
        let ts = to_db_time(now);
        let row = sqlx::query(
            r#"
            UPDATE indexes
            SET state = 'processing',
                started_at = ?,
                last_heartbeat_at = ?,
                worker_id = ?
            WHERE id = (
                SELECT id FROM indexes
                WHERE state = 'queued' AND cancel_requested = 0
                ORDER BY queued_at ASC, id ASC
                LIMIT 1
            )
            AND state = 'queued'
            RETURNING *
            "#,
        )
        .bind(&ts)
        .bind(&ts)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let index = index_from_row(&row)?;
        METRICS.inc_indexes_claimed();
        info!(
            index_id = index.id,
            worker = worker_id,
            retry_count = index.retry_count,
            "Claimed index"
        );
        Ok(Some(index))
    }

    /// Record the outcome of a claimed record and return its new state.
    ///
    /// Only the worker holding the claim may report; anything else is
    /// rejected with [`StoreError::InvalidState`].
    pub async fn report(
        &self,
        id: IndexId,
        worker_id: &str,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<IndexState> {
        let ts = to_db_time(now);
        let state: Option<String> = match outcome {
            JobOutcome::Completed { execution_log } => {
                sqlx::query_scalar(
                    r#"
                    UPDATE indexes
                    SET state = 'completed', finished_at = ?, execution_log = ?,
                        failure_message = NULL, failure_category = NULL
                    WHERE id = ? AND state = 'processing' AND worker_id = ?
                    RETURNING state
                    "#,
                )
                .bind(&ts)
                .bind(clip(execution_log))
                .bind(id)
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await?
            }
            JobOutcome::TerminalFailure {
                message,
                category,
                execution_log,
            } => {
                sqlx::query_scalar(
                    r#"
                    UPDATE indexes
                    SET state = 'errored', finished_at = ?, execution_log = ?,
                        failure_message = ?, failure_category = ?
                    WHERE id = ? AND state = 'processing' AND worker_id = ?
                    RETURNING state
                    "#,
                )
                .bind(&ts)
                .bind(clip(execution_log))
                .bind(message)
                .bind(category.as_str())
                .bind(id)
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await?
            }
            JobOutcome::Cancelled {
                message,
                execution_log,
            } => {
                sqlx::query_scalar(
                    r#"
                    UPDATE indexes
                    SET state = 'cancelled', finished_at = ?, execution_log = ?,
                        failure_message = ?, failure_category = 'cancelled'
                    WHERE id = ? AND state = 'processing' AND worker_id = ?
                    RETURNING state
                    "#,
                )
                .bind(&ts)
                .bind(clip(execution_log))
                .bind(message)
                .bind(id)
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await?
            }
            JobOutcome::RetryableFailure {
                message,
                category,
                execution_log,
            } => {
                // A pending cancellation wins over a retry; otherwise requeue
                // while retry_count + 1 stays below the bound.
                sqlx::query_scalar(
                    r#"
                    UPDATE indexes
                    SET retry_count = CASE WHEN cancel_requested = 1
                            THEN retry_count ELSE retry_count + 1 END,
                        state = CASE
                            WHEN cancel_requested = 1 THEN 'cancelled'
                            WHEN retry_count + 1 < ? THEN 'queued'
                            ELSE 'errored' END,
                        finished_at = CASE
                            WHEN cancel_requested = 0 AND retry_count + 1 < ? THEN NULL
                            ELSE ? END,
                        started_at = CASE
                            WHEN cancel_requested = 0 AND retry_count + 1 < ? THEN NULL
                            ELSE started_at END,
                        worker_id = CASE
                            WHEN cancel_requested = 0 AND retry_count + 1 < ? THEN NULL
                            ELSE worker_id END,
                        last_heartbeat_at = NULL,
                        failure_message = ?,
                        failure_category = CASE WHEN cancel_requested = 1
                            THEN 'cancelled' ELSE ? END,
                        execution_log = ?
                    WHERE id = ? AND state = 'processing' AND worker_id = ?
                    RETURNING state
                    "#,
                )
                .bind(self.max_retries)
                .bind(self.max_retries)
                .bind(&ts)
                .bind(self.max_retries)
                .bind(self.max_retries)
                .bind(message)
                .bind(category.as_str())
                .bind(clip(execution_log))
                .bind(id)
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let Some(state) = state else {
            return Err(match self.get(id).await? {
                None => StoreError::not_found(format!("index {}", id)),
                Some(index) => StoreError::invalid_state(format!(
                    "index {} is {} (worker {:?}), not processing for worker {}",
                    id, index.state, index.worker_id, worker_id
                )),
            });
        };
        let state: IndexState = state.parse().map_err(StoreError::Corrupt)?;

        match (outcome, state) {
            (JobOutcome::RetryableFailure { .. }, IndexState::Queued) => {
                METRICS.inc_indexes_retried();
                info!(index_id = id, worker = worker_id, "Index failed, requeued for retry");
            }
            (_, IndexState::Completed) => {
                METRICS.inc_indexes_completed();
                info!(index_id = id, worker = worker_id, "Index completed");
            }
            (_, IndexState::Errored) => {
                METRICS.inc_indexes_failed();
                warn!(index_id = id, worker = worker_id, "Index errored");
            }
            (_, IndexState::Cancelled) => {
                METRICS.inc_indexes_cancelled();
                info!(index_id = id, worker = worker_id, "Index cancelled");
            }
            _ => {}
        }
        Ok(state)
    }

    /// Refresh liveness of the worker's claimed records.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        ids: &[IndexId],
        now: DateTime<Utc>,
    ) -> StoreResult<HeartbeatResponse> {
        let ts = to_db_time(now);
        let mut response = HeartbeatResponse::default();
        let mut tx = self.pool.begin().await?;
        for &id in ids {
            let cancel_requested: Option<bool> = sqlx::query_scalar(
                r#"
                UPDATE indexes
                SET last_heartbeat_at = ?
                WHERE id = ? AND state = 'processing' AND worker_id = ?
                RETURNING cancel_requested
                "#,
            )
            .bind(&ts)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(cancel_requested) = cancel_requested {
                response.known.push(id);
                if cancel_requested {
                    response.cancel.push(id);
                }
            }
        }
        tx.commit().await?;
        Ok(response)
    }

    /// Return `processing` records whose heartbeat is older than `timeout` to
    /// the queue, or error them once retries are exhausted.
    pub async fn reclaim_stale(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ReclaimSummary> {
        let cutoff = to_db_time(now - timeout);
        let message = format!(
            "No heartbeat from the claiming worker for {} seconds",
            timeout.num_seconds()
        );
        let rows = sqlx::query(
            r#"
            UPDATE indexes
            SET retry_count = CASE WHEN cancel_requested = 1
                    THEN retry_count ELSE retry_count + 1 END,
                state = CASE
                    WHEN cancel_requested = 1 THEN 'cancelled'
                    WHEN retry_count + 1 < ? THEN 'queued'
                    ELSE 'errored' END,
                finished_at = CASE
                    WHEN cancel_requested = 0 AND retry_count + 1 < ? THEN NULL
                    ELSE ? END,
                started_at = CASE
                    WHEN cancel_requested = 0 AND retry_count + 1 < ? THEN NULL
                    ELSE started_at END,
                worker_id = NULL,
                last_heartbeat_at = NULL,
                failure_message = CASE WHEN cancel_requested = 1 THEN ? ELSE ? END,
                failure_category = CASE WHEN cancel_requested = 1
                    THEN 'cancelled' ELSE 'heartbeat_lost' END
            WHERE state = 'processing'
              AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?)
            RETURNING id, state
            "#,
        )
        .bind(self.max_retries)
        .bind(self.max_retries)
        .bind(to_db_time(now))
        .bind(self.max_retries)
        .bind(CANCELLED_BY_USER_MESSAGE)
        .bind(&message)
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ReclaimSummary::default();
        for row in rows {
            let id: IndexId = row.try_get("id")?;
            let state: String = row.try_get("state")?;
            match state.parse::<IndexState>().map_err(StoreError::Corrupt)? {
                IndexState::Queued => summary.requeued.push(id),
                IndexState::Cancelled => summary.cancelled.push(id),
                _ => summary.errored.push(id),
            }
        }

        if summary.total() > 0 {
            METRICS.add_indexes_reclaimed(summary.total() as u64);
            warn!(
                requeued = summary.requeued.len(),
                errored = summary.errored.len(),
                cancelled = summary.cancelled.len(),
                "Reclaimed stale indexes"
            );
        }
        Ok(summary)
    }

    /// Cancel a record. Queued records are cancelled at once; processing ones
    /// are flagged and the worker learns about it on its next heartbeat.
    /// Terminal records are left untouched. Returns the resulting state.
    pub async fn cancel(&self, id: IndexId, now: DateTime<Utc>) -> StoreResult<IndexState> {
        let cancelled: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE indexes
            SET state = 'cancelled', finished_at = ?, failure_message = ?,
                failure_category = 'cancelled'
            WHERE id = ? AND state = 'queued'
            RETURNING state
            "#,
        )
        .bind(to_db_time(now))
        .bind(CANCELLED_BY_USER_MESSAGE)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if cancelled.is_some() {
            METRICS.inc_indexes_cancelled();
            info!(index_id = id, "Cancelled queued index");
            return Ok(IndexState::Cancelled);
        }

        let flagged = sqlx::query(
            "UPDATE indexes SET cancel_requested = 1 WHERE id = ? AND state = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if flagged > 0 {
            info!(index_id = id, "Requested cancellation of processing index");
            return Ok(IndexState::Processing);
        }

        self.get(id)
            .await?
            .map(|index| index.state)
            .ok_or_else(|| StoreError::not_found(format!("index {}", id)))
    }

    pub async fn get(&self, id: IndexId) -> StoreResult<Option<Index>> {
        let row = sqlx::query("SELECT * FROM indexes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(index_from_row).transpose()
    }

    /// Newest first.
    pub async fn list(&self, filter: &IndexFilter) -> StoreResult<Vec<Index>> {
        let state = filter.state.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"
            SELECT * FROM indexes
            WHERE (? IS NULL OR repository_id = ?)
              AND (? IS NULL OR commit_sha = ?)
              AND (? IS NULL OR state = ?)
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(filter.repository_id)
        .bind(filter.repository_id)
        .bind(filter.commit.as_deref())
        .bind(filter.commit.as_deref())
        .bind(state)
        .bind(state)
        .bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(index_from_row).collect()
    }

    /// Delete a terminal record. Returns false when it does not exist.
    pub async fn delete(&self, id: IndexId) -> StoreResult<bool> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM indexes
            WHERE id = ? AND state IN ('completed', 'errored', 'cancelled')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if deleted > 0 {
            info!(index_id = id, "Deleted index");
            return Ok(true);
        }

        match self.get(id).await? {
            None => Ok(false),
            Some(index) => Err(StoreError::invalid_state(format!(
                "index {} is {}; only terminal records can be deleted",
                id, index.state
            ))),
        }
    }

    pub async fn stats(&self) -> StoreResult<QueueStats> {
        let stats: QueueStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'queued') AS queued,
                COUNT(*) FILTER (WHERE state = 'processing') AS processing,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                COUNT(*) FILTER (WHERE state = 'errored') AS errored,
                COUNT(*) FILTER (WHERE state = 'cancelled') AS cancelled
            FROM indexes
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    /// The queued or processing record for a tuple, if any.
    pub async fn active_for(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        configuration: &str,
    ) -> StoreResult<Option<Index>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM indexes
            WHERE repository_id = ? AND commit_sha = ? AND configuration = ?
              AND state IN ('queued', 'processing')
            "#,
        )
        .bind(repository_id)
        .bind(commit)
        .bind(configuration)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(index_from_row).transpose()
    }

    /// Whether the tuple has a record in any of `states`.
    pub async fn has_record_in_states(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        configuration: &str,
        states: &[IndexState],
    ) -> StoreResult<bool> {
        if states.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            r#"
            SELECT id FROM indexes
            WHERE repository_id = ? AND commit_sha = ? AND configuration = ?
              AND state IN ({})
            LIMIT 1
            "#,
            placeholders
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(repository_id)
            .bind(commit)
            .bind(configuration);
        for state in states {
            query = query.bind(state.as_str());
        }
        Ok(query.fetch_optional(&self.pool).await?.is_some())
    }
}

fn clip(log: &Option<String>) -> Option<&str> {
    log.as_deref()
        .map(|text| log_tail(text, MAX_EXECUTION_LOG_BYTES))
}

fn index_from_row(row: &SqliteRow) -> StoreResult<Index> {
    let job: String = row.try_get("job")?;
    let trigger: String = row.try_get("trigger_kind")?;
    let state: String = row.try_get("state")?;
    let queued_at: String = row.try_get("queued_at")?;
    let failure_category: Option<String> = row.try_get("failure_category")?;

    Ok(Index {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        repository_name: row.try_get("repository_name")?,
        commit: row.try_get("commit_sha")?,
        configuration: row.try_get("configuration")?,
        job: serde_json::from_str(&job)?,
        trigger: trigger.parse().map_err(StoreError::Corrupt)?,
        policy_id: row.try_get("policy_id")?,
        state: state.parse().map_err(StoreError::Corrupt)?,
        queued_at: from_db_time(&queued_at)?,
        started_at: from_db_time_opt(row.try_get("started_at")?)?,
        finished_at: from_db_time_opt(row.try_get("finished_at")?)?,
        last_heartbeat_at: from_db_time_opt(row.try_get("last_heartbeat_at")?)?,
        worker_id: row.try_get("worker_id")?,
        retry_count: row.try_get("retry_count")?,
        failure_message: row.try_get("failure_message")?,
        failure_category: failure_category
            .map(|c| c.parse::<FailureCategory>())
            .transpose()
            .map_err(StoreError::Corrupt)?,
        execution_log: row.try_get("execution_log")?,
        cancel_requested: row.try_get("cancel_requested")?,
    })
}
