//! Job queue for worker jobs.

mod memory;
mod postgres;

pub use memory::MemoryJobQueue;
pub use postgres::PgJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use slotlock_db::DbResult;
use std::time::Duration;
use uuid::Uuid;

use crate::dedup::DeduplicationOptions;

/// A job to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub worker_name: String,
    pub args: Value,
    /// Run no earlier than this. `None` runs immediately.
    pub run_at: Option<DateTime<Utc>>,
    pub deduplication: DeduplicationOptions,
}

impl NewJob {
    pub fn new(worker_name: impl Into<String>, args: Value) -> Self {
        Self {
            worker_name: worker_name.into(),
            args,
            run_at: None,
            deduplication: DeduplicationOptions::none(),
        }
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn deduplication(mut self, deduplication: DeduplicationOptions) -> Self {
        self.deduplication = deduplication;
        self
    }

    /// Whether the job runs later than `now`.
    pub fn is_scheduled(&self, now: DateTime<Utc>) -> bool {
        self.run_at.is_some_and(|at| at > now)
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { job_id: Uuid },
    /// Dropped in favor of `existing`, which still holds the key.
    Deduplicated {
        existing: Uuid,
        reschedule_pending: bool,
    },
}

impl EnqueueOutcome {
    pub fn is_deduplicated(&self) -> bool {
        matches!(self, EnqueueOutcome::Deduplicated { .. })
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Enqueued { job_id } => *job_id,
            EnqueueOutcome::Deduplicated { existing, .. } => *existing,
        }
    }
}

impl std::fmt::Display for EnqueueOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueOutcome::Enqueued { job_id } => write!(f, "enqueued job {}", job_id),
            EnqueueOutcome::Deduplicated {
                existing,
                reschedule_pending,
            } => {
                write!(f, "deduplicated into job {}", existing)?;
                if *reschedule_pending {
                    write!(f, " (follow-up pending)")?;
                }
                Ok(())
            }
        }
    }
}

/// A job claimed by a worker. Its deduplication key is already released.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub worker_name: String,
    pub args: Value,
    pub attempt: i32,
    /// A duplicate was dropped while queued; one follow-up is owed.
    pub reschedule: bool,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> DbResult<EnqueueOutcome>;

    /// Claim the next due job, releasing its deduplication key.
    async fn claim(&self, worker_id: &str) -> DbResult<Option<ClaimedJob>>;

    async fn complete(&self, job: &ClaimedJob) -> DbResult<()>;

    /// Record a failure. With `retry_at` the job runs again at that time as
    /// its next attempt, without a deduplication key; otherwise it is dead.
    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> DbResult<()>;

    /// Return a claimed job to pending as the same attempt.
    async fn release(&self, job: &ClaimedJob) -> DbResult<()>;

    /// Return jobs claimed longer than `older_than` ago to pending.
    /// Returns how many were requeued.
    async fn requeue_stale(&self, older_than: Duration) -> DbResult<u64>;
}
