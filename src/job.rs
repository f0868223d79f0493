use std::fmt::Display;

use chrono::{DateTime, Utc};

/// Identifier for a [`CrawlJob`] row.
///
/// Ids are allocated monotonically, so ordering two ids orders the jobs by
/// creation.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The lifecycle state of a [`CrawlJob`].
///
/// `Queued` and `Crawling` are the non-terminal states; at most one
/// non-terminal job may exist per entity at any time. `Success` and `Failed`
/// are terminal: no automatic transition leaves them without an explicit
/// requeue/reset call.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobStatus {
    Queued,
    Crawling,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// One crawl job row: the unit of outstanding work for a single target
/// entity.
///
/// `visible_at` gates dequeue eligibility and doubles as the delayed-retry
/// timer: a failed-and-retrying job is re-queued with `visible_at` in the
/// future so it stays invisible until its backoff elapses.
#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub id: JobId,
    /// Stable key of the crawl target. Unique across non-terminal jobs.
    pub entity_id: String,
    pub status: JobStatus,
    /// Higher dequeues first.
    pub priority: i32,
    /// Number of failed attempts so far.
    pub retries: u16,
    pub last_attempt: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Provenance of the enqueue, e.g. `"api"` or `"scheduler:front_page"`.
    pub enqueued_by: String,
    /// Earliest instant the job may be claimed.
    pub visible_at: DateTime<Utc>,
    /// Set only while status is `Failed`-and-retrying; mirrors `visible_at`.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named recurring definition that the scheduler expands into [`CrawlJob`]s.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: i64,
    /// Unique name; also used as the entity id when `entity_id` is absent.
    pub name: String,
    pub entity_id: Option<String>,
    /// A named token (`@hourly`, ...) or `@every <duration>`. See
    /// [`crate::cron::CronSchedule`].
    pub cron_expression: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Propagated to the crawl job this definition creates, when positive.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

impl ScheduledJob {
    /// The entity the expanded crawl job targets.
    pub fn target(&self) -> &str {
        self.entity_id.as_deref().unwrap_or(&self.name)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn job_ids_order_by_their_numeric_value() {
        let earlier = JobId::from(3);
        let later = JobId::from(7);
        assert!(later > earlier);
        assert_eq!([later, earlier].iter().max(), Some(&later));
    }

    #[test]
    fn job_status_terminality() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Crawling.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn scheduled_job_due_requires_enabled_and_elapsed() {
        let now = Utc::now();
        let job = ScheduledJob {
            id: 1,
            name: "front_page".to_owned(),
            entity_id: None,
            cron_expression: "@hourly".to_owned(),
            enabled: true,
            last_run_at: None,
            next_run_at: Some(now - TimeDelta::seconds(1)),
            priority: 0,
            created_at: now,
            updated_at: now,
            created_by: "test".to_owned(),
        };
        assert!(job.is_due(now));

        let disabled = ScheduledJob {
            enabled: false,
            ..job.clone()
        };
        assert!(!disabled.is_due(now));

        let future = ScheduledJob {
            next_run_at: Some(now + TimeDelta::minutes(5)),
            ..job.clone()
        };
        assert!(!future.is_due(now));

        let never = ScheduledJob {
            next_run_at: None,
            ..job
        };
        assert!(!never.is_due(now));
    }

    #[test]
    fn target_falls_back_to_name() {
        let now = Utc::now();
        let mut job = ScheduledJob {
            id: 1,
            name: "rust".to_owned(),
            entity_id: None,
            cron_expression: "@daily".to_owned(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            priority: 0,
            created_at: now,
            updated_at: now,
            created_by: "test".to_owned(),
        };
        assert_eq!(job.target(), "rust");
        job.entity_id = Some("programming".to_owned());
        assert_eq!(job.target(), "programming");
    }
}
