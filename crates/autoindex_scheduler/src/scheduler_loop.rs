//! Periodic driver: membership refresh, heartbeat reaper, scheduling cycle.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::scheduler::IndexScheduler;

pub struct SchedulerLoop {
    scheduler: Arc<IndexScheduler>,
}

impl SchedulerLoop {
    pub fn new(scheduler: Arc<IndexScheduler>) -> Self {
        Self { scheduler }
    }

    /// Run every stage once. A failing stage is logged and the next one
    /// still runs.
    pub async fn tick(&self, now: DateTime<Utc>) {
        if let Err(e) = self.scheduler.refresh_policy_membership(now).await {
            error!(error = %e, "Policy membership refresh failed");
        }

        let timeout = self.scheduler.config().heartbeat_timeout();
        if let Err(e) = self.scheduler.queue().reclaim_stale(timeout, now).await {
            error!(error = %e, "Stale index reclaim failed");
        }

        if let Err(e) = self.scheduler.schedule_cycle(now).await {
            error!(error = %e, "Scheduling cycle failed");
        }
    }

    /// Tick on the configured interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let period = self.scheduler.config().interval();
        info!(interval_secs = period.as_secs(), "Index scheduler started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Index scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
