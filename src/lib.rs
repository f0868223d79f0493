//! Durable crawl queue, recurring scheduler, and resilient fetch engine for
//! polite API crawlers.
//!
//! The crate covers the part of a crawler that decides *what* work to do
//! next, *when* to retry it, and *how hard* to push against a rate-limited
//! remote service:
//!
//! - [`queue`]: the durable job table: at most one in-flight crawl per
//!   entity, priority-aware dequeue, time-gated visibility, and a retry
//!   budget, all expressed as conditional status transitions.
//! - [`scheduler`] + [`cron`]: a ticking loop that expands named recurring
//!   definitions (`@hourly`, `@every 30m`, ...) into queue entries.
//! - [`recovery`]: startup and periodic sweeps that reset orphaned in-flight
//!   jobs and requeue stale successes.
//! - [`fetch`] + [`classify`]: the retry/backoff/classification envelope
//!   around each outbound call.
//!
//! Workers dequeue jobs, issue calls through the [`fetch::FetchEngine`], and
//! translate the classified outcome back into `complete`/`fail` transitions
//! on the queue. [`Crawlq`] wires the background loops together around a
//! shared store.

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod classify;
pub mod config;
pub mod cron;
pub mod fetch;
pub mod job;
pub mod prelude;
pub mod queue;
pub mod recovery;
pub mod scheduler;

use config::Config;
use cron::CronSchedule;
use queue::{JobStore, ScheduleDefinition};
use recovery::Maintenance;
use scheduler::Scheduler;

/// Assembles the queue's background services around a shared store.
///
/// ```
/// # use crawlq::prelude::*;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), CrawlqError> {
/// let crawlq = Crawlq::new(InMemoryStore::new(), Config::default())
///     .with_scheduler()
///     .with_maintenance();
/// # crawlq.graceful_shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Crawlq<S: JobStore> {
    store: S,
    config: Config,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<S> Crawlq<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: S, config: Config) -> Self {
        Self {
            store,
            config,
            cancellation_token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawns the schedule-expansion loop.
    pub fn with_scheduler(mut self) -> Self {
        let handle = Scheduler::new(self.store.clone(), &self.config)
            .spawn(self.cancellation_token.child_token());
        self.handles.push(handle);
        self
    }

    /// Spawns the recovery/freshness maintenance loop.
    pub fn with_maintenance(mut self) -> Self {
        let handle = Maintenance::new(self.store.clone(), &self.config)
            .spawn(self.cancellation_token.child_token());
        self.handles.push(handle);
        self
    }

    /// Validates and installs a recurring schedule definition.
    pub async fn add_schedule(&self, definition: ScheduleDefinition<'_>) -> Result<(), CrawlqError> {
        CronSchedule::validate(definition.cron_expression)?;
        self.store.upsert_schedule(definition).await?;
        Ok(())
    }

    /// Stops every spawned loop and waits for them to finish.
    pub async fn graceful_shutdown(self) -> Result<(), CrawlqError> {
        tracing::debug!("Shutting down crawlq tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CrawlqError::GracefulShutdownFailed)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CrawlqError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the job store")]
    Store(#[from] queue::StoreError),
    #[error("Invalid cron expression")]
    Cron(#[from] cron::CronError),
    #[error("Invalid configuration")]
    Config(#[from] config::ConfigError),
    #[error("Fetch failed")]
    Fetch(#[from] fetch::FetchError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::InMemoryStore;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn setup_and_shutdown() {
        let crawlq = Crawlq::new(InMemoryStore::new(), Config::default())
            .with_scheduler()
            .with_maintenance();
        crawlq.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_schedule_validates_the_expression() {
        let crawlq = Crawlq::new(InMemoryStore::new(), Config::default());
        crawlq
            .add_schedule(ScheduleDefinition {
                name: "front_page",
                entity_id: None,
                cron_expression: "@every 30m",
                enabled: true,
                priority: 0,
                created_by: "test",
            })
            .await
            .unwrap();

        let result = crawlq
            .add_schedule(ScheduleDefinition {
                name: "broken",
                entity_id: None,
                cron_expression: "*/5 * * * *",
                enabled: true,
                priority: 0,
                created_by: "test",
            })
            .await;
        assert_matches!(result, Err(CrawlqError::Cron(_)));
    }
}
