//! In-memory job queue.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use slotlock_db::DbResult;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{ClaimedJob, EnqueueOutcome, JobQueue, NewJob};
use crate::dedup::{DuplicateState, dedup_key};

#[derive(Debug)]
struct PendingJob {
    id: Uuid,
    worker_name: String,
    args: serde_json::Value,
    attempt: i32,
    /// Key this job holds, if any.
    dedup_key: Option<String>,
    /// Follow-up still owed by a requeued job.
    reschedule: bool,
}

struct RunningJob {
    job: ClaimedJob,
    claimed_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    seq: u64,
    /// Ordered by run time, then enqueue order.
    pending: BTreeMap<(DateTime<Utc>, u64), PendingJob>,
    keys: HashMap<(String, String), DuplicateState>,
    running: HashMap<Uuid, RunningJob>,
    completed: usize,
    dead: Vec<(Uuid, String)>,
}

impl State {
    fn push(&mut self, run_at: DateTime<Utc>, job: PendingJob) {
        self.seq += 1;
        self.pending.insert((run_at, self.seq), job);
    }

    /// Put a running job back in line as the same attempt.
    fn requeue(&mut self, job: ClaimedJob, run_at: DateTime<Utc>) {
        self.push(
            run_at,
            PendingJob {
                id: job.id,
                worker_name: job.worker_name,
                args: job.args,
                attempt: job.attempt,
                dedup_key: None,
                reschedule: job.reschedule,
            },
        );
    }
}

/// Job queue held in process memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<State>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs not yet claimed, due or scheduled.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Pending jobs for one worker.
    pub async fn pending_for(&self, worker_name: &str) -> usize {
        let state = self.state.lock().await;
        state
            .pending
            .values()
            .filter(|job| job.worker_name == worker_name)
            .count()
    }

    pub async fn running_len(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub async fn completed_len(&self) -> usize {
        self.state.lock().await.completed
    }

    /// Dead jobs with their last error.
    pub async fn dead(&self) -> Vec<(Uuid, String)> {
        self.state.lock().await.dead.clone()
    }

    /// Run time of the next pending job.
    pub async fn next_run_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state.pending.keys().next().map(|(at, _)| *at)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> DbResult<EnqueueOutcome> {
        let now = Utc::now();
        let opts = job.deduplication;
        let key = opts
            .holds_key(job.is_scheduled(now))
            .then(|| (job.worker_name.clone(), dedup_key(&job.args)));

        let mut state = self.state.lock().await;

        if let Some(key) = &key {
            if let Some(existing) = state.keys.get(key).copied() {
                let updated = existing.on_duplicate(opts.if_deduplicated);
                state.keys.insert(key.clone(), updated);
                debug!(
                    worker = %job.worker_name,
                    existing = %updated.job_id(),
                    "Dropped duplicate job"
                );
                return Ok(EnqueueOutcome::Deduplicated {
                    existing: updated.job_id(),
                    reschedule_pending: updated.reschedule_pending(),
                });
            }
        }

        let job_id = Uuid::now_v7();
        if let Some(key) = &key {
            state.keys.insert(key.clone(), DuplicateState::Queued { job_id });
        }
        state.push(
            job.run_at.unwrap_or(now),
            PendingJob {
                id: job_id,
                worker_name: job.worker_name,
                args: job.args,
                attempt: 0,
                dedup_key: key.map(|(_, k)| k),
                reschedule: false,
            },
        );
        Ok(EnqueueOutcome::Enqueued { job_id })
    }

    async fn claim(&self, _worker_id: &str) -> DbResult<Option<ClaimedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let Some(slot) = state
            .pending
            .keys()
            .next()
            .filter(|(run_at, _)| *run_at <= now)
            .copied()
        else {
            return Ok(None);
        };
        let Some(job) = state.pending.remove(&slot) else {
            return Ok(None);
        };

        let flagged = match job.dedup_key {
            Some(key) => state
                .keys
                .remove(&(job.worker_name.clone(), key))
                .is_some_and(|s| s.reschedule_pending()),
            None => false,
        };
        let claimed = ClaimedJob {
            id: job.id,
            worker_name: job.worker_name,
            args: job.args,
            attempt: job.attempt,
            reschedule: job.reschedule || flagged,
        };
        state.running.insert(
            claimed.id,
            RunningJob {
                job: claimed.clone(),
                claimed_at: now,
            },
        );

        Ok(Some(claimed))
    }

    async fn complete(&self, job: &ClaimedJob) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.running.remove(&job.id);
        state.completed += 1;
        Ok(())
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.running.remove(&job.id);
        match retry_at {
            Some(run_at) => state.push(
                run_at,
                PendingJob {
                    id: job.id,
                    worker_name: job.worker_name.clone(),
                    args: job.args.clone(),
                    attempt: job.attempt + 1,
                    dedup_key: None,
                    reschedule: false,
                },
            ),
            None => state.dead.push((job.id, error.to_string())),
        }
        Ok(())
    }

    async fn release(&self, job: &ClaimedJob) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.running.remove(&job.id) {
            state.requeue(running.job, Utc::now());
        }
        Ok(())
    }

    async fn requeue_stale(&self, older_than: Duration) -> DbResult<u64> {
        let now = Utc::now();
        let Some(cutoff) = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };

        let mut state = self.state.lock().await;
        let stale: Vec<Uuid> = state
            .running
            .iter()
            .filter(|(_, running)| running.claimed_at <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(running) = state.running.remove(id) {
                debug!(job_id = %id, worker = %running.job.worker_name, "Requeued stale job");
                state.requeue(running.job, now);
            }
        }
        Ok(stale.len() as u64)
    }
}
