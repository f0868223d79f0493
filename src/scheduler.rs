//! The clock-driven loop that expands recurring schedule definitions into
//! concrete queue entries.
//!
//! The loop runs one batch per tick, plus an initial batch immediately on
//! start. Per due definition it enqueues a crawl job (propagating a positive
//! priority), then re-evaluates the cron expression against now. A broken
//! expression is logged and `next_run_at` is deliberately left untouched so
//! the definition stays due and keeps surfacing on every tick until it is
//! fixed, rather than silently going dormant.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    cron::CronSchedule,
    job::ScheduledJob,
    queue::{EnqueueRequest, JobStore, StoreError},
};

pub struct Scheduler<S> {
    store: S,
    tick: Duration,
}

impl<S> Scheduler<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: S, config: &Config) -> Self {
        Self {
            store,
            tick: config.tick(),
        }
    }

    /// Spawns the scheduler loop.
    ///
    /// The first batch runs immediately rather than waiting out a full tick.
    /// Cancelling the token stops the loop; cancelling it again is a no-op.
    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.run_once().await,
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the crawl scheduler");
                        break;
                    }
                }
            }
        })
    }

    /// Processes one batch of due schedules.
    ///
    /// A failure on one definition is logged and does not abort the rest of
    /// the batch.
    pub async fn run_once(&self) {
        let due = match self.store.due_schedules(Utc::now()).await {
            Ok(due) => due,
            Err(error) => {
                tracing::error!(?error, "Failed to load due schedules: {error}");
                return;
            }
        };
        for schedule in due {
            if let Err(error) = self.expand(&schedule).await {
                tracing::error!(
                    ?error,
                    schedule = schedule.name,
                    "Failed to expand schedule: {error}"
                );
            }
        }
    }

    async fn expand(&self, schedule: &ScheduledJob) -> Result<(), StoreError> {
        let now = Utc::now();
        let enqueued_by = format!("scheduler:{}", schedule.name);
        match self
            .store
            .enqueue(EnqueueRequest {
                entity_id: schedule.target(),
                priority: schedule.priority.max(0),
                enqueued_by: &enqueued_by,
            })
            .await
        {
            Ok(_) => {}
            // A uniqueness race means another enqueue already happened.
            Err(StoreError::Conflict(_)) => {}
            Err(error) => return Err(error),
        }

        let next = schedule
            .cron_expression
            .parse::<CronSchedule>()
            .and_then(|parsed| parsed.next_after(now));
        match next {
            Ok(next_run_at) => {
                self.store
                    .mark_schedule_run(&schedule.name, now, next_run_at)
                    .await
            }
            Err(error) => {
                // Leave next_run_at untouched: the definition stays due and
                // is retried (and logged) every tick until it is fixed.
                tracing::error!(
                    %error,
                    schedule = schedule.name,
                    expression = schedule.cron_expression,
                    "Broken cron expression: {error}"
                );
                Ok(())
            }
        }
    }
}
