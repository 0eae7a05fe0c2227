//! Where a worker gets jobs from and reports them to.

use async_trait::async_trait;
use autoindex_protocol::{Index, IndexId, IndexState};
use autoindex_scheduler::{HeartbeatResponse, IndexQueue, JobOutcome, StoreResult};
use chrono::Utc;

/// The claim/heartbeat/report protocol, the only way a worker touches index
/// records.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn claim(&self, worker_id: &str) -> StoreResult<Option<Index>>;

    async fn heartbeat(&self, worker_id: &str, ids: &[IndexId]) -> StoreResult<HeartbeatResponse>;

    async fn report(
        &self,
        id: IndexId,
        worker_id: &str,
        outcome: &JobOutcome,
    ) -> StoreResult<IndexState>;
}

#[async_trait]
impl JobSource for IndexQueue {
    async fn claim(&self, worker_id: &str) -> StoreResult<Option<Index>> {
        IndexQueue::claim(self, worker_id, Utc::now()).await
    }

    async fn heartbeat(&self, worker_id: &str, ids: &[IndexId]) -> StoreResult<HeartbeatResponse> {
        IndexQueue::heartbeat(self, worker_id, ids, Utc::now()).await
    }

    async fn report(
        &self,
        id: IndexId,
        worker_id: &str,
        outcome: &JobOutcome,
    ) -> StoreResult<IndexState> {
        IndexQueue::report(self, id, worker_id, outcome, Utc::now()).await
    }
}
