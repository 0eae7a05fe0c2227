//! SQLite-backed state for policies, membership, the index queue and scan
//! bookkeeping.
//!
//! Timestamps are RFC 3339 text with a fixed width, so SQL comparisons on the
//! text order the same way the instants do.

mod configs;
mod policies;
mod queue;
mod scans;
mod schema;

pub use configs::RepositoryConfigStore;
pub use policies::PolicyStore;
pub use queue::{
    EnqueueOutcome, HeartbeatResponse, IndexFilter, IndexQueue, JobOutcome, NewIndex, QueueStats,
    ReclaimSummary,
};
pub use scans::{RepositoryScan, ScanKind};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{StoreError, StoreResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn open(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            // Schedulers and executors write concurrently.
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "Opened state store");
        Ok(store)
    }

    /// Single-connection in-memory database. Every pooled connection to
    /// `:memory:` would be a separate database, hence the one connection.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn policies(&self) -> PolicyStore {
        PolicyStore::new(self.pool.clone())
    }

    pub fn queue(&self) -> IndexQueue {
        IndexQueue::new(self.pool.clone())
    }

    pub fn configs(&self) -> RepositoryConfigStore {
        RepositoryConfigStore::new(self.pool.clone())
    }
}

pub(crate) fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| StoreError::corrupt(format!("bad timestamp '{}': {}", text, err)))
}

pub(crate) fn from_db_time_opt(text: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    text.as_deref().map(from_db_time).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_db_time_is_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert_eq!(to_db_time(a).len(), to_db_time(b).len());
        assert!(to_db_time(a) < to_db_time(b));
        assert_eq!(from_db_time(&to_db_time(b)).unwrap(), b);
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", tmp.path().join("state.sqlite").display());
        let store = Store::open(&url, 4).await.unwrap();
        assert_eq!(store.queue().stats().await.unwrap().queued, 0);
    }
}
