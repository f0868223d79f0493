//! Recovery and freshness maintenance for the job queue.
//!
//! Two sweeps keep the queue honest across process restarts:
//!
//! - `reset_incomplete` forces jobs stuck in `crawling` back to `queued` once
//!   their claim stamp is older than the reset threshold. A worker that died
//!   mid-crawl leaves no heartbeat; the stale stamp is the only crash signal.
//! - `requeue_stale` re-enqueues entities whose last successful crawl is
//!   older than the freshness threshold.
//!
//! Both are idempotent and safe to run redundantly, so the loop simply runs
//! them together on every pass, including one pass immediately on start.

use std::time::Duration;

use chrono::TimeDelta;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    queue::{JobStore, StoreError},
};

pub struct Maintenance<S> {
    store: S,
    reset_after: TimeDelta,
    stale_after: TimeDelta,
    interval: Duration,
}

impl<S> Maintenance<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: S, config: &Config) -> Self {
        Self {
            store,
            reset_after: config.reset_after(),
            stale_after: config.stale_after(),
            interval: config.maintenance_interval(),
        }
    }

    /// The startup recovery call: resets orphaned in-flight jobs so work
    /// lost to a crash becomes claimable again before any worker starts.
    pub async fn recover_on_startup(&self) -> Result<u64, StoreError> {
        let reset = self.store.reset_incomplete(self.reset_after).await?;
        if reset > 0 {
            tracing::warn!(reset, "Recovered orphaned in-flight jobs on startup");
        }
        Ok(reset)
    }

    /// Spawns the periodic maintenance loop. The first pass runs
    /// immediately.
    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.run_once().await,
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down queue maintenance");
                        break;
                    }
                }
            }
        })
    }

    /// One maintenance pass: both sweeps, errors logged rather than fatal.
    pub async fn run_once(&self) {
        let (reset, requeued) = futures::join!(
            self.store.reset_incomplete(self.reset_after),
            self.store.requeue_stale(self.stale_after),
        );
        match reset {
            Ok(0) => {}
            Ok(count) => tracing::warn!(count, "Reset orphaned in-flight jobs"),
            Err(error) => tracing::error!(?error, "Failed to reset incomplete jobs: {error}"),
        }
        match requeued {
            Ok(0) => {}
            Ok(count) => tracing::debug!(count, "Requeued stale entities for refresh"),
            Err(error) => tracing::error!(?error, "Failed to requeue stale entities: {error}"),
        }
    }
}
