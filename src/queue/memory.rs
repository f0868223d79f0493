//! An in-memory implementation of [`JobStore`].
//!
//! It is a correct (but not optimized) implementation: every operation takes
//! the write lock for the whole read-check-write section, which makes each
//! status transition atomic with respect to concurrent claimers and recovery
//! sweeps. Useful as the reference semantics for other backends and for
//! tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{EnqueueRequest, Enqueued, JobStore, ScheduleDefinition, StoreError};
use crate::{
    backoff::Strategy,
    job::{CrawlJob, JobId, JobStatus, ScheduledJob},
};

/// Provenance stamped on jobs created by the freshness sweep.
const REQUEUED_BY: &str = "maintenance:requeue_stale";

/// An in-memory [`JobStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<CrawlJob>>>,
    schedules: Arc<RwLock<Vec<ScheduledJob>>>,
    job_ids: Arc<AtomicI64>,
    schedule_ids: Arc<AtomicI64>,
}

impl InMemoryStore {
    /// Creates a new empty instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_job(&self, jobs: &mut Vec<CrawlJob>, request: EnqueueRequest<'_>) -> JobId {
        let now = Utc::now();
        let id = JobId::from(self.job_ids.fetch_add(1, Ordering::SeqCst) + 1);
        jobs.push(CrawlJob {
            id,
            entity_id: request.entity_id.to_owned(),
            status: JobStatus::Queued,
            priority: request.priority,
            retries: 0,
            last_attempt: None,
            duration_ms: None,
            enqueued_by: request.enqueued_by.to_owned(),
            visible_at: now,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        });
        id
    }
}

fn find_job<'a>(jobs: &'a mut [CrawlJob], id: JobId) -> Result<&'a mut CrawlJob, StoreError> {
    jobs.iter_mut()
        .find(|job| job.id == id)
        .ok_or(StoreError::JobNotFound(id))
}

fn expect_status(job: &CrawlJob, expected: JobStatus) -> Result<(), StoreError> {
    if job.status == expected {
        Ok(())
    } else {
        Err(StoreError::UnexpectedStatus {
            id: job.id,
            expected,
            actual: job.status,
        })
    }
}

impl CrawlJob {
    fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Crawling;
        self.last_attempt = Some(now);
        self.updated_at = now;
    }

    fn mark_success(&mut self, now: DateTime<Utc>, duration_ms: i64) {
        self.status = JobStatus::Success;
        self.duration_ms = Some(duration_ms);
        self.next_retry_at = None;
        self.updated_at = now;
    }

    fn mark_retryable(&mut self, now: DateTime<Utc>, delay: TimeDelta) {
        self.status = JobStatus::Queued;
        self.visible_at = now + delay;
        self.next_retry_at = Some(self.visible_at);
        self.updated_at = now;
    }

    fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    fn mark_reset(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.visible_at = now;
        self.next_retry_at = None;
        self.updated_at = now;
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue(&self, request: EnqueueRequest<'_>) -> Result<Enqueued, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if let Some(job) = jobs
            .iter_mut()
            .find(|job| job.entity_id == request.entity_id && !job.status.is_terminal())
        {
            // Higher-priority enqueues win; lower or equal is a pure no-op.
            if request.priority > job.priority {
                job.priority = request.priority;
                job.updated_at = Utc::now();
            }
            return Ok(Enqueued::Existing(job.id));
        }
        Ok(Enqueued::Created(self.insert_job(&mut jobs, request)))
    }

    async fn dequeue(&self, limit: usize) -> Result<Vec<CrawlJob>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut eligible = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.status == JobStatus::Queued && job.visible_at <= now)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        eligible.sort_by(|&a, &b| {
            jobs[b]
                .priority
                .cmp(&jobs[a].priority)
                .then(jobs[a].visible_at.cmp(&jobs[b].visible_at))
        });
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for index in eligible {
            let job = &mut jobs[index];
            job.mark_claimed(now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, id: JobId, duration_ms: i64) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let job = find_job(&mut jobs, id)?;
        expect_status(job, JobStatus::Crawling)?;
        job.mark_success(Utc::now(), duration_ms);
        Ok(())
    }

    async fn fail(
        &self,
        id: JobId,
        max_retries: u16,
        backoff: &(dyn Strategy + Send + Sync),
    ) -> Result<JobStatus, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let job = find_job(&mut jobs, id)?;
        expect_status(job, JobStatus::Crawling)?;
        job.retries += 1;
        if job.retries < max_retries {
            let delay = backoff.backoff(job.retries);
            job.mark_retryable(now, delay);
        } else {
            job.mark_failed(now);
        }
        Ok(job.status)
    }

    async fn fail_permanently(&self, id: JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let job = find_job(&mut jobs, id)?;
        expect_status(job, JobStatus::Crawling)?;
        job.retries += 1;
        job.mark_failed(Utc::now());
        Ok(())
    }

    async fn reset_incomplete(&self, older_than: TimeDelta) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = now - older_than;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut reset = 0;
        for job in jobs.iter_mut() {
            if job.status == JobStatus::Crawling
                && job.last_attempt.is_some_and(|attempt| attempt < cutoff)
            {
                job.mark_reset(now);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn requeue_stale(&self, older_than: TimeDelta) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - older_than;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;

        // Ids are monotonic, so the highest id per entity is its most recent
        // job.
        let mut latest: HashMap<&str, &CrawlJob> = HashMap::new();
        for job in jobs.iter() {
            match latest.get(job.entity_id.as_str()) {
                Some(existing) if existing.id > job.id => {}
                _ => {
                    latest.insert(job.entity_id.as_str(), job);
                }
            }
        }
        let stale = latest
            .into_values()
            .filter(|job| job.status == JobStatus::Success && job.updated_at < cutoff)
            .map(|job| (job.entity_id.clone(), job.priority))
            .collect::<Vec<_>>();

        for (entity_id, priority) in &stale {
            self.insert_job(
                &mut jobs,
                EnqueueRequest {
                    entity_id,
                    priority: *priority,
                    enqueued_by: REQUEUED_BY,
                },
            );
        }
        Ok(stale.len() as u64)
    }

    async fn job(&self, id: JobId) -> Result<Option<CrawlJob>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn job_for_entity(&self, entity_id: &str) -> Result<Option<CrawlJob>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs
            .iter()
            .filter(|job| job.entity_id == entity_id)
            .max_by_key(|job| job.id)
            .cloned())
    }

    async fn upsert_schedule(&self, definition: ScheduleDefinition<'_>) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut schedules = self.schedules.write().map_err(|_| StoreError::BadState)?;
        if let Some(schedule) = schedules
            .iter_mut()
            .find(|schedule| schedule.name == definition.name)
        {
            if schedule.cron_expression != definition.cron_expression {
                schedule.cron_expression = definition.cron_expression.to_owned();
                // A changed expression becomes due immediately so the next
                // scheduler pass re-evaluates it.
                schedule.next_run_at = Some(now);
            }
            schedule.entity_id = definition.entity_id.map(ToOwned::to_owned);
            schedule.enabled = definition.enabled;
            schedule.priority = definition.priority;
            schedule.updated_at = now;
            return Ok(());
        }
        let id = self.schedule_ids.fetch_add(1, Ordering::SeqCst) + 1;
        schedules.push(ScheduledJob {
            id,
            name: definition.name.to_owned(),
            entity_id: definition.entity_id.map(ToOwned::to_owned),
            cron_expression: definition.cron_expression.to_owned(),
            enabled: definition.enabled,
            last_run_at: None,
            next_run_at: Some(now),
            priority: definition.priority,
            created_at: now,
            updated_at: now,
            created_by: definition.created_by.to_owned(),
        });
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let schedules = self.schedules.read().map_err(|_| StoreError::BadState)?;
        let mut due = schedules
            .iter()
            .filter(|schedule| schedule.is_due(now))
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by_key(|schedule| schedule.next_run_at);
        Ok(due)
    }

    async fn mark_schedule_run(
        &self,
        name: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write().map_err(|_| StoreError::BadState)?;
        let schedule = schedules
            .iter_mut()
            .find(|schedule| schedule.name == name)
            .ok_or_else(|| StoreError::ScheduleNotFound(name.to_owned()))?;
        schedule.last_run_at = Some(last_run_at);
        schedule.next_run_at = Some(next_run_at);
        schedule.updated_at = last_run_at;
        Ok(())
    }
}

#[cfg(test)]
impl InMemoryStore {
    /// Test helper: rewrites a job's claim stamp to simulate age.
    pub(crate) fn backdate_last_attempt(&self, id: JobId, last_attempt: DateTime<Utc>) {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.iter_mut().find(|job| job.id == id).unwrap();
        job.last_attempt = Some(last_attempt);
    }

    /// Test helper: rewrites a job's last-updated stamp to simulate age.
    pub(crate) fn backdate_updated_at(&self, id: JobId, updated_at: DateTime<Utc>) {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.iter_mut().find(|job| job.id == id).unwrap();
        job.updated_at = updated_at;
    }
}
