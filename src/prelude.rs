//! Convenient all-in-one import for working with crawlq.

pub use crate::{
    backoff::{BackoffStrategy, Jitter, Strategy},
    classify::{classify, ClassifiedError, ErrorKind},
    config::{Config, ConfigError},
    cron::{CronError, CronSchedule},
    fetch::{
        AttemptObserver, AttemptOutcome, AttemptResult, FetchEngine, FetchError, Pacer, PacerError,
        RequestFactory, TracingObserver,
    },
    job::{CrawlJob, JobId, JobStatus, ScheduledJob},
    queue::{
        memory::InMemoryStore, EnqueueRequest, Enqueued, JobStore, ScheduleDefinition, StoreError,
    },
    recovery::Maintenance,
    scheduler::Scheduler,
    Crawlq, CrawlqError,
};
