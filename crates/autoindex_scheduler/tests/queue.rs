//! Queue lifecycle, claim exclusivity and scan bookkeeping.

mod common;

use autoindex_protocol::{FailureCategory, IndexState};
use autoindex_scheduler::{
    IndexFilter, IndexQueue, JobOutcome, ScanKind, Store, StoreError,
};
use chrono::Duration;
use common::{head_policy, new_index, t0};
use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};

async fn queue() -> (Store, IndexQueue) {
    let store = Store::open_in_memory().await.unwrap();
    let queue = store.queue().with_max_retries(3);
    (store, queue)
}

fn retryable() -> JobOutcome {
    JobOutcome::RetryableFailure {
        message: "sandbox provisioning failed".to_string(),
        category: FailureCategory::Infrastructure,
        execution_log: None,
    }
}

#[tokio::test]
async fn claims_are_mutually_exclusive() {
    let (_store, queue) = queue().await;
    for i in 0..5 {
        queue
            .enqueue(&new_index(1, &format!("c{}", i), "auto:x"), t0())
            .await
            .unwrap();
    }

    let claims = join_all((0..8).map(|w| {
        let queue = queue.clone();
        async move { queue.claim(&format!("worker-{}", w), t0()).await.unwrap() }
    }))
    .await;

    let claimed: Vec<_> = claims.into_iter().flatten().collect();
    assert_eq!(claimed.len(), 5);
    let ids: HashSet<_> = claimed.iter().map(|index| index.id).collect();
    assert_eq!(ids.len(), 5);
    assert!(claimed.iter().all(|index| index.state == IndexState::Processing));
    assert!(queue.claim("late", t0()).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_enqueue_coalesces() {
    let (_store, queue) = queue().await;
    let outcomes = join_all((0..2).map(|_| {
        let queue = queue.clone();
        async move { queue.enqueue(&new_index(1, "X", "auto"), t0()).await.unwrap() }
    }))
    .await;

    assert_eq!(outcomes[0].index.id, outcomes[1].index.id);
    assert_eq!(outcomes.iter().filter(|o| o.coalesced).count(), 1);
    assert_eq!(queue.stats().await.unwrap().queued, 1);
}

/// File-backed store with a real connection pool, so claims race across
/// connections instead of queueing behind a single one.
async fn pooled_queue() -> (tempfile::TempDir, Store, IndexQueue) {
    let tmp = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", tmp.path().join("state.sqlite").display());
    let store = Store::open(&url, 8).await.unwrap();
    let queue = store.queue().with_max_retries(3);
    (tmp, store, queue)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pooled_claims_are_mutually_exclusive() {
    let (_tmp, _store, queue) = pooled_queue().await;
    for i in 0..21 {
        queue
            .enqueue(&new_index(1, &format!("c{}", i), "auto:x"), t0())
            .await
            .unwrap();
    }

    let workers: Vec<_> = (0..8)
        .map(|w| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let worker_id = format!("worker-{}", w);
                let mut claimed = Vec::new();
                while let Some(index) = queue.claim(&worker_id, t0()).await.unwrap() {
                    claimed.push(index.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    assert_eq!(all.len(), 21);
    assert_eq!(all.iter().collect::<HashSet<_>>().len(), 21);
    assert_eq!(queue.stats().await.unwrap().processing, 21);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pooled_enqueue_coalesces() {
    let (_tmp, _store, queue) = pooled_queue().await;
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.enqueue(&new_index(1, "X", "auto"), t0()).await.unwrap()
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }
    let ids: HashSet<_> = outcomes.iter().map(|o| o.index.id).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(outcomes.iter().filter(|o| !o.coalesced).count(), 1);
    assert_eq!(queue.stats().await.unwrap().queued, 1);
}

#[tokio::test]
async fn claim_takes_oldest_first() {
    let (_store, queue) = queue().await;
    let late = queue
        .enqueue(&new_index(1, "late", "auto"), t0() + Duration::minutes(5))
        .await
        .unwrap();
    let early = queue.enqueue(&new_index(1, "early", "auto"), t0()).await.unwrap();

    let first = queue.claim("w", t0()).await.unwrap().unwrap();
    assert_eq!(first.id, early.index.id);
    let second = queue.claim("w", t0()).await.unwrap().unwrap();
    assert_eq!(second.id, late.index.id);
}

#[tokio::test]
async fn retries_are_bounded_and_monotonic() {
    let (_store, queue) = queue().await;
    let id = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap().index.id;

    let mut last_retry = 0;
    for attempt in 1..=3 {
        let claimed = queue.claim("w", t0()).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        let state = queue.report(id, "w", &retryable(), t0()).await.unwrap();
        let index = queue.get(id).await.unwrap().unwrap();
        assert!(index.retry_count > last_retry);
        last_retry = index.retry_count;
        if attempt < 3 {
            assert_eq!(state, IndexState::Queued);
            assert!(index.worker_id.is_none());
        } else {
            assert_eq!(state, IndexState::Errored);
            assert_eq!(index.failure_category, Some(FailureCategory::Infrastructure));
            assert!(index.finished_at.is_some());
        }
    }
    assert_eq!(last_retry, 3);
    assert!(queue.claim("w", t0()).await.unwrap().is_none());
}

#[tokio::test]
async fn terminal_failure_is_never_retried() {
    let (_store, queue) = queue().await;
    let id = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap().index.id;
    queue.claim("w", t0()).await.unwrap().unwrap();

    let outcome = JobOutcome::TerminalFailure {
        message: "step 1 exited with status 1".to_string(),
        category: FailureCategory::CommandFailed,
        execution_log: Some("compiling...\nerror".to_string()),
    };
    assert_eq!(
        queue.report(id, "w", &outcome, t0()).await.unwrap(),
        IndexState::Errored
    );

    let index = queue.get(id).await.unwrap().unwrap();
    assert_eq!(index.retry_count, 0);
    assert_eq!(index.failure_category, Some(FailureCategory::CommandFailed));
    assert_eq!(index.execution_log.as_deref(), Some("compiling...\nerror"));
    assert!(queue.claim("w", t0()).await.unwrap().is_none());
}

#[tokio::test]
async fn only_the_claiming_worker_may_report() {
    let (_store, queue) = queue().await;
    let id = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap().index.id;
    queue.claim("owner", t0()).await.unwrap().unwrap();

    let done = JobOutcome::Completed {
        execution_log: None,
    };
    assert!(matches!(
        queue.report(id, "intruder", &done, t0()).await,
        Err(StoreError::InvalidState(_))
    ));
    assert_eq!(
        queue.report(id, "owner", &done, t0()).await.unwrap(),
        IndexState::Completed
    );
    assert!(matches!(
        queue.report(id, "owner", &done, t0()).await,
        Err(StoreError::InvalidState(_))
    ));
    assert!(matches!(
        queue.report(999, "owner", &done, t0()).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn cancel_queued_and_processing() {
    let (_store, queue) = queue().await;
    let running = queue.enqueue(&new_index(1, "a", "auto"), t0()).await.unwrap().index.id;
    let waiting = queue.enqueue(&new_index(1, "b", "auto"), t0()).await.unwrap().index.id;

    // Same timestamp; the lower id is claimed first.
    let claimed = queue.claim("w", t0()).await.unwrap().unwrap();
    assert_eq!(claimed.id, running);
    assert_eq!(queue.cancel(waiting, t0()).await.unwrap(), IndexState::Cancelled);
    assert!(queue.claim("w", t0()).await.unwrap().is_none());

    assert_eq!(queue.cancel(running, t0()).await.unwrap(), IndexState::Processing);
    let beat = queue.heartbeat("w", &[running], t0()).await.unwrap();
    assert_eq!(beat.known, vec![running]);
    assert_eq!(beat.cancel, vec![running]);

    let outcome = JobOutcome::Cancelled {
        message: "Cancelled by user".to_string(),
        execution_log: None,
    };
    assert_eq!(
        queue.report(running, "w", &outcome, t0()).await.unwrap(),
        IndexState::Cancelled
    );
    assert_eq!(queue.cancel(running, t0()).await.unwrap(), IndexState::Cancelled);
    assert!(matches!(
        queue.cancel(404, t0()).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn retryable_failure_after_cancel_request_cancels() {
    let (_store, queue) = queue().await;
    let id = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap().index.id;
    queue.claim("w", t0()).await.unwrap().unwrap();
    queue.cancel(id, t0()).await.unwrap();

    assert_eq!(
        queue.report(id, "w", &retryable(), t0()).await.unwrap(),
        IndexState::Cancelled
    );
    assert_eq!(queue.get(id).await.unwrap().unwrap().retry_count, 0);
}

#[tokio::test]
async fn stale_processing_records_are_reclaimed() {
    let (_store, queue) = queue().await;
    let id = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap().index.id;
    queue.claim("lost", t0()).await.unwrap().unwrap();

    let fresh = queue
        .reclaim_stale(Duration::seconds(60), t0() + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(fresh.total(), 0);

    let summary = queue
        .reclaim_stale(Duration::seconds(60), t0() + Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(summary.requeued, vec![id]);

    let index = queue.get(id).await.unwrap().unwrap();
    assert_eq!(index.state, IndexState::Queued);
    assert_eq!(index.retry_count, 1);
    assert_eq!(index.failure_category, Some(FailureCategory::HeartbeatLost));

    // The lost worker no longer owns the record.
    let beat = queue.heartbeat("lost", &[id], t0()).await.unwrap();
    assert!(beat.known.is_empty());
    let done = JobOutcome::Completed {
        execution_log: None,
    };
    assert!(queue.report(id, "lost", &done, t0()).await.is_err());
}

#[tokio::test]
async fn reclaim_at_retry_bound_errors() {
    let store = Store::open_in_memory().await.unwrap();
    let queue = store.queue().with_max_retries(1);
    let id = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap().index.id;
    queue.claim("lost", t0()).await.unwrap().unwrap();

    let summary = queue
        .reclaim_stale(Duration::seconds(60), t0() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(summary.errored, vec![id]);
    let index = queue.get(id).await.unwrap().unwrap();
    assert_eq!(index.state, IndexState::Errored);
    assert_eq!(index.failure_category, Some(FailureCategory::HeartbeatLost));
}

#[tokio::test]
async fn heartbeats_keep_records_alive() {
    let (_store, queue) = queue().await;
    let id = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap().index.id;
    queue.claim("w", t0()).await.unwrap().unwrap();

    let later = t0() + Duration::seconds(50);
    let beat = queue.heartbeat("w", &[id, 12345], later).await.unwrap();
    assert_eq!(beat.known, vec![id]);
    assert!(beat.cancel.is_empty());

    let summary = queue
        .reclaim_stale(Duration::seconds(60), t0() + Duration::seconds(90))
        .await
        .unwrap();
    assert_eq!(summary.total(), 0);
}

#[tokio::test]
async fn terminal_records_free_the_tuple() {
    let (_store, queue) = queue().await;
    let first = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap();
    queue.claim("w", t0()).await.unwrap().unwrap();
    let done = JobOutcome::Completed {
        execution_log: None,
    };
    queue.report(first.index.id, "w", &done, t0()).await.unwrap();

    let second = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap();
    assert!(!second.coalesced);
    assert_ne!(second.index.id, first.index.id);
    assert!(queue
        .has_record_in_states(1, "c", "auto", &[IndexState::Completed])
        .await
        .unwrap());
    assert!(!queue
        .has_record_in_states(1, "c", "auto", &[IndexState::Errored])
        .await
        .unwrap());
}

#[tokio::test]
async fn delete_only_terminal_records() {
    let (_store, queue) = queue().await;
    let id = queue.enqueue(&new_index(1, "c", "auto"), t0()).await.unwrap().index.id;
    assert!(matches!(
        queue.delete(id).await,
        Err(StoreError::InvalidState(_))
    ));
    queue.cancel(id, t0()).await.unwrap();
    assert!(queue.delete(id).await.unwrap());
    assert!(!queue.delete(id).await.unwrap());
}

#[tokio::test]
async fn list_filters_and_stats() {
    let (_store, queue) = queue().await;
    queue.enqueue(&new_index(1, "a", "auto"), t0()).await.unwrap();
    queue.enqueue(&new_index(1, "b", "auto"), t0()).await.unwrap();
    queue.enqueue(&new_index(2, "a", "auto"), t0()).await.unwrap();
    queue.claim("w", t0()).await.unwrap().unwrap();

    let repo_one = queue
        .list(&IndexFilter {
            repository_id: Some(1),
            ..IndexFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(repo_one.len(), 2);
    assert!(repo_one[0].id > repo_one[1].id);

    let processing = queue
        .list(&IndexFilter {
            state: Some(IndexState::Processing),
            ..IndexFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(processing.len(), 1);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.processing, 1);
}

async fn with_membership(store: &Store, repositories: &[i64]) {
    let policy = store
        .policies()
        .create(&head_policy(&["*"]), false, t0())
        .await
        .unwrap();
    store
        .policies()
        .replace_membership(policy.id, &repositories.iter().copied().collect::<BTreeSet<_>>())
        .await
        .unwrap();
}

#[tokio::test]
async fn global_policies_nominate_repositories_only_when_enabled() {
    let (store, queue) = queue().await;
    let mut global = head_policy(&[]);
    global.repository_patterns = None;
    let policy = store.policies().create(&global, true, t0()).await.unwrap();
    store
        .policies()
        .replace_membership(policy.id, &BTreeSet::from([1, 2]))
        .await
        .unwrap();
    let delay = Duration::hours(1);

    assert!(queue
        .repositories_due_for_scan(ScanKind::Indexing, delay, 10, t0())
        .await
        .unwrap()
        .is_empty());

    let with_globals = queue.clone().with_global_policies(true);
    assert_eq!(
        with_globals
            .repositories_due_for_scan(ScanKind::Indexing, delay, 10, t0())
            .await
            .unwrap(),
        vec![1, 2]
    );
}

#[tokio::test]
async fn never_scanned_repositories_are_due_first() {
    let (store, queue) = queue().await;
    with_membership(&store, &[3, 1, 2]).await;
    let delay = Duration::hours(1);

    let first = queue
        .repositories_due_for_scan(ScanKind::Indexing, delay, 2, t0())
        .await
        .unwrap();
    assert_eq!(first, vec![1, 2]);
    let second = queue
        .repositories_due_for_scan(ScanKind::Indexing, delay, 2, t0())
        .await
        .unwrap();
    assert_eq!(second, vec![3]);
    assert!(queue
        .repositories_due_for_scan(ScanKind::Indexing, delay, 2, t0() + Duration::minutes(30))
        .await
        .unwrap()
        .is_empty());

    let later = t0() + Duration::hours(1);
    assert_eq!(
        queue
            .repositories_due_for_scan(ScanKind::Indexing, delay, 10, later)
            .await
            .unwrap(),
        vec![1, 2, 3]
    );

    // Retention scans keep their own clock, but this policy has no retention facet.
    assert!(queue
        .repositories_due_for_scan(ScanKind::Retention, delay, 10, t0())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn concurrent_scan_claims_are_disjoint() {
    let (store, queue) = queue().await;
    with_membership(&store, &[1, 2, 3, 4, 5, 6]).await;

    let batches = join_all((0..3).map(|_| {
        let queue = queue.clone();
        async move {
            queue
                .repositories_due_for_scan(ScanKind::Indexing, Duration::hours(1), 10, t0())
                .await
                .unwrap()
        }
    }))
    .await;

    let mut seen = HashSet::new();
    for batch in &batches {
        for id in batch {
            assert!(seen.insert(*id), "repository {} handed out twice", id);
        }
    }
    assert_eq!(seen.len(), 6);
}

#[tokio::test]
async fn inference_failures_suppress_automatic_scans() {
    let store = Store::open_in_memory().await.unwrap();
    let queue = store.queue().with_inference_failure_threshold(2);
    with_membership(&store, &[1, 2]).await;

    assert_eq!(queue.record_inference_failure(1, "boom", t0()).await.unwrap(), 1);
    assert!(!queue.is_inference_suppressed(1).await.unwrap());
    assert_eq!(queue.record_inference_failure(1, "boom", t0()).await.unwrap(), 2);
    assert!(queue.is_inference_suppressed(1).await.unwrap());

    let due = queue
        .repositories_due_for_scan(ScanKind::Indexing, Duration::hours(1), 10, t0())
        .await
        .unwrap();
    assert_eq!(due, vec![2]);

    let scan = queue.scan_state(1).await.unwrap().unwrap();
    assert_eq!(scan.consecutive_inference_failures, 2);
    assert_eq!(scan.last_inference_error.as_deref(), Some("boom"));

    queue.record_inference_success(1, t0()).await.unwrap();
    assert!(!queue.is_inference_suppressed(1).await.unwrap());
    assert!(queue.scan_state(1).await.unwrap().unwrap().last_inference_error.is_none());
}
