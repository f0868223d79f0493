//! The durable job queue: crash-safe representation of pending, active, and
//! terminal crawl work.
//!
//! The queue is expressed as the [`JobStore`] trait so that the scheduler,
//! recovery routines, and workers are all written against the same seam
//! regardless of the backing store. Every status transition is a conditional
//! write keyed on the expected prior status; a transition against a job in
//! any other state fails with [`StoreError::UnexpectedStatus`] instead of
//! silently clobbering a concurrent claim or recovery sweep.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::{
    backoff::Strategy,
    job::{CrawlJob, JobId, JobStatus, ScheduledJob},
};

pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("scheduled job {0:?} not found")]
    ScheduleNotFound(String),
    /// The store's uniqueness constraint fired under a race. Callers must
    /// treat this as success: another enqueue already happened.
    #[error("a non-terminal job already exists for entity {0:?}")]
    Conflict(String),
    #[error("job {id} is {actual:?}, expected {expected:?}")]
    UnexpectedStatus {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("store in bad state")]
    BadState,
}

/// Parameters for [`JobStore::enqueue`].
#[derive(Debug, Clone, Copy)]
pub struct EnqueueRequest<'a> {
    pub entity_id: &'a str,
    pub priority: i32,
    pub enqueued_by: &'a str,
}

/// The outcome of an idempotent enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A fresh `queued` row was created.
    Created(JobId),
    /// A non-terminal job already existed for the entity; its priority may
    /// have been raised but no new row was created.
    Existing(JobId),
}

impl Enqueued {
    pub fn id(&self) -> JobId {
        match self {
            Self::Created(id) | Self::Existing(id) => *id,
        }
    }
}

/// A scheduled-job definition for [`JobStore::upsert_schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleDefinition<'a> {
    pub name: &'a str,
    pub entity_id: Option<&'a str>,
    pub cron_expression: &'a str,
    pub enabled: bool,
    pub priority: i32,
    pub created_by: &'a str,
}

/// The durable store behind the queue, the scheduler, and the recovery
/// routines.
///
/// Implementations must make [`JobStore::dequeue`]'s claim step atomic: two
/// concurrent callers must never receive the same job.
#[async_trait]
pub trait JobStore: Clone + Send + Sync {
    /// Creates a `queued` job for `entity_id` unless a non-terminal job
    /// already exists for it.
    ///
    /// Enqueue is idempotent: an existing non-terminal job makes this a
    /// no-op, except that a strictly higher requested priority raises the
    /// stored priority (never lowers it).
    async fn enqueue(&self, request: EnqueueRequest<'_>) -> Result<Enqueued, StoreError>;

    /// Atomically claims up to `limit` visible `queued` jobs, ordered by
    /// priority descending then earliest `visible_at`, transitioning each to
    /// `crawling` and stamping `last_attempt`.
    async fn dequeue(&self, limit: usize) -> Result<Vec<CrawlJob>, StoreError>;

    /// Marks a `crawling` job terminally successful.
    async fn complete(&self, id: JobId, duration_ms: i64) -> Result<(), StoreError>;

    /// Records a failed attempt on a `crawling` job.
    ///
    /// While the retry budget lasts the job goes back to `queued` with
    /// `visible_at = next_retry_at = now + backoff(retries)`; once `retries`
    /// reaches `max_retries` it becomes terminally `failed`. Returns the
    /// resulting status.
    async fn fail(
        &self,
        id: JobId,
        max_retries: u16,
        backoff: &(dyn Strategy + Send + Sync),
    ) -> Result<JobStatus, StoreError>;

    /// Marks a `crawling` job terminally `failed` without consulting the
    /// retry budget. Used for permanently classified errors such as a
    /// private or banned target.
    async fn fail_permanently(&self, id: JobId) -> Result<(), StoreError>;

    /// Crash-recovery sweep: forces any job still `crawling` whose
    /// `last_attempt` is older than `older_than` back to `queued` with
    /// immediate visibility. Returns the number of jobs reset.
    async fn reset_incomplete(&self, older_than: TimeDelta) -> Result<u64, StoreError>;

    /// Freshness sweep: for every entity whose most recent job is a
    /// `success` older than `older_than`, enqueues a new crawl (subject to
    /// the enqueue idempotency rule). Returns the number of jobs created.
    async fn requeue_stale(&self, older_than: TimeDelta) -> Result<u64, StoreError>;

    async fn job(&self, id: JobId) -> Result<Option<CrawlJob>, StoreError>;

    /// The most recently created job for an entity, terminal or not.
    async fn job_for_entity(&self, entity_id: &str) -> Result<Option<CrawlJob>, StoreError>;

    /// Creates or updates a named schedule definition.
    ///
    /// A new definition (and an existing one whose expression changed) has
    /// `next_run_at` set to now, so the next scheduler pass picks it up and
    /// advances it through its own cron evaluation.
    async fn upsert_schedule(&self, definition: ScheduleDefinition<'_>) -> Result<(), StoreError>;

    /// Enabled schedules with `next_run_at <= now`, earliest first.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Records a successful expansion: persists `last_run_at` and the newly
    /// computed `next_run_at`.
    async fn mark_schedule_run(
        &self,
        name: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
