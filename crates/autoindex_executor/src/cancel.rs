//! Cancellation tokens for the jobs a worker is running.
//!
//! The heartbeat task cancels a job when the queue asks for it or no longer
//! recognises the claim; shutdown cancels whatever outlives the grace period.

use autoindex_protocol::IndexId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct RunningJobs {
    jobs: Mutex<HashMap<IndexId, CancellationToken>>,
    shutting_down: AtomicBool,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a claimed job and return its token.
    pub fn register(&self, id: IndexId) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(id, token.clone());
        token
    }

    pub fn remove(&self, id: IndexId) {
        self.lock().remove(&id);
    }

    /// Ids of running jobs, ascending.
    pub fn ids(&self) -> Vec<IndexId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns false when the job is not running here.
    pub fn cancel(&self, id: IndexId) -> bool {
        match self.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything because the process is stopping.
    pub fn cancel_all_for_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for token in self.lock().values() {
            token.cancel();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IndexId, CancellationToken>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
