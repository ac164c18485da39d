//! Workers and the runner that feeds them from the job queue.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use slotlock_config::{RetryConfig, WorkerConfig};
use slotlock_core::Result;
use slotlock_db::DbResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::dedup::DeduplicationOptions;
use crate::queue::{ClaimedJob, JobQueue, NewJob};

/// A unit of background work, addressed by name.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    fn deduplication(&self) -> DeduplicationOptions {
        DeduplicationOptions::none()
    }

    async fn perform(&self, args: &Value) -> Result<()>;

    /// A job for this worker with its deduplication options.
    fn job(&self, args: Value) -> NewJob {
        NewJob::new(self.name(), args).deduplication(self.deduplication())
    }
}

/// Workers by name.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<&'static str, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(worker.name(), worker);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.workers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Claims jobs and dispatches them to registered workers.
#[derive(Clone)]
pub struct WorkerRunner {
    queue: Arc<dyn JobQueue>,
    registry: Arc<WorkerRegistry>,
    config: WorkerConfig,
    retry: RetryConfig,
}

impl WorkerRunner {
    pub fn new(queue: Arc<dyn JobQueue>, registry: WorkerRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            config,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run `concurrency` claim loops until `shutdown` turns true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.config.id,
            concurrency = self.config.concurrency,
            workers = ?self.registry.names(),
            "Starting worker runner"
        );

        let loops = (0..self.config.concurrency.max(1)).map(|slot| {
            let runner = self.clone();
            let shutdown = shutdown.clone();
            async move { runner.claim_loop(slot, shutdown).await }
        });
        futures::future::join(
            futures::future::join_all(loops),
            self.reap_loop(shutdown.clone()),
        )
        .await;

        info!(worker_id = %self.config.id, "Worker runner stopped");
    }

    async fn claim_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        let worker_id = format!("{}-{}", self.config.id, slot);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once(&worker_id).await {
                Ok(true) => continue,
                Ok(false) => self.config.poll_interval(),
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Failed to process job");
                    self.config.error_backoff()
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Requeue abandoned claims every half claim timeout.
    async fn reap_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.claim_timeout() / 2;

        loop {
            tokio::select! {
                _ = sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.requeue_stale().await {
                warn!(worker_id = %self.config.id, error = %e, "Failed to requeue stale jobs");
            }
        }
    }

    /// Return jobs claimed longer than the claim timeout ago to pending.
    pub async fn requeue_stale(&self) -> DbResult<u64> {
        let requeued = self
            .queue
            .requeue_stale(self.config.claim_timeout())
            .await?;
        if requeued > 0 {
            warn!(worker_id = %self.config.id, requeued, "Requeued stale jobs");
        }
        Ok(requeued)
    }

    /// Claim and process one due job. Returns false when none was due.
    ///
    /// When the job cannot be settled it is released back to pending so it
    /// runs again.
    pub async fn run_once(&self, worker_id: &str) -> DbResult<bool> {
        let Some(job) = self.queue.claim(worker_id).await? else {
            return Ok(false);
        };
        debug!(job_id = %job.id, worker = %job.worker_name, worker_id, "Claimed job");

        if let Err(e) = self.process(&job).await {
            if let Err(release_err) = self.queue.release(&job).await {
                warn!(job_id = %job.id, error = %release_err, "Failed to release job");
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Process due jobs until none is left. Returns the number processed.
    pub async fn run_until_idle(&self) -> DbResult<usize> {
        let mut processed = 0;
        while self.run_once(&self.config.id).await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn process(&self, job: &ClaimedJob) -> DbResult<()> {
        let Some(worker) = self.registry.get(&job.worker_name) else {
            error!(job_id = %job.id, worker = %job.worker_name, "No worker registered for job");
            let message = format!("unknown worker: {}", job.worker_name);
            return self.queue.fail(job, &message, None).await;
        };

        let settled = self.settle(job, worker.perform(&job.args).await).await;

        // Owed even when settling failed
        if job.reschedule {
            let delay = worker.deduplication().reschedule_delay;
            let follow_up = worker.job(job.args.clone()).run_at(after(delay));
            let outcome = self.queue.enqueue(follow_up).await?;
            debug!(job_id = %job.id, worker = %job.worker_name, %outcome, "Rescheduled follow-up");
        }

        settled
    }

    /// Record the outcome of a run: complete, retry or bury.
    async fn settle(&self, job: &ClaimedJob, result: Result<()>) -> DbResult<()> {
        match result {
            Ok(()) => {
                self.queue.complete(job).await?;
                debug!(job_id = %job.id, worker = %job.worker_name, "Job completed");
            }
            Err(err) => {
                let attempt = u32::try_from(job.attempt).unwrap_or(0);
                let message = err.to_string();
                if err.is_retryable() && attempt + 1 < self.retry.max_attempts {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        job_id = %job.id,
                        worker = %job.worker_name,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %message,
                        "Job failed, retrying"
                    );
                    self.queue.fail(job, &message, Some(after(delay))).await?;
                } else {
                    error!(
                        job_id = %job.id,
                        worker = %job.worker_name,
                        attempt,
                        error = %message,
                        "Job failed permanently"
                    );
                    self.queue.fail(job, &message, None).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOutcome, MemoryJobQueue};
    use serde_json::json;
    use slotlock_core::Error;
    use slotlock_db::DbError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records every call; fails with the configured error.
    struct RecordingWorker {
        calls: Mutex<Vec<Value>>,
        fail_with: Option<fn() -> Error>,
        deduplication: DeduplicationOptions,
    }

    impl RecordingWorker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_with: None,
                deduplication: DeduplicationOptions::none(),
            }
        }

        fn failing(fail_with: fn() -> Error) -> Self {
            Self {
                fail_with: Some(fail_with),
                ..Self::new()
            }
        }

        fn deduplicated() -> Self {
            Self {
                deduplication: DeduplicationOptions::until_executing()
                    .with_reschedule_delay(Duration::ZERO),
                ..Self::new()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Worker for RecordingWorker {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn deduplication(&self) -> DeduplicationOptions {
            self.deduplication
        }

        async fn perform(&self, args: &Value) -> Result<()> {
            self.calls.lock().unwrap().push(args.clone());
            match self.fail_with {
                Some(make_error) => Err(make_error()),
                None => Ok(()),
            }
        }
    }

    fn runner(queue: &MemoryJobQueue, worker: Arc<RecordingWorker>) -> WorkerRunner {
        let config = WorkerConfig {
            poll_interval_ms: 10,
            ..WorkerConfig::default()
        };
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
        };
        WorkerRunner::new(
            Arc::new(queue.clone()),
            WorkerRegistry::new().register(worker),
            config,
        )
        .with_retry(retry)
    }

    #[tokio::test]
    async fn test_run_until_idle_completes_jobs() {
        let queue = MemoryJobQueue::new();
        let worker = Arc::new(RecordingWorker::new());
        let runner = runner(&queue, worker.clone());

        queue.enqueue(worker.job(json!([1]))).await.unwrap();
        queue.enqueue(worker.job(json!([2]))).await.unwrap();

        assert_eq!(runner.run_until_idle().await.unwrap(), 2);
        assert_eq!(worker.call_count(), 2);
        assert_eq!(queue.completed_len().await, 2);
    }

    #[tokio::test]
    async fn test_retryable_error_retried_until_exhausted() {
        let queue = MemoryJobQueue::new();
        let worker = Arc::new(RecordingWorker::failing(|| Error::Conflict("stale".into())));
        let runner = runner(&queue, worker.clone());

        queue.enqueue(worker.job(json!([1]))).await.unwrap();
        runner.run_until_idle().await.unwrap();

        assert_eq!(worker.call_count(), 3);
        let dead = queue.dead().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("stale"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_dead_immediately() {
        let queue = MemoryJobQueue::new();
        let worker = Arc::new(RecordingWorker::failing(|| Error::Forbidden("nope".into())));
        let runner = runner(&queue, worker.clone());

        queue.enqueue(worker.job(json!([1]))).await.unwrap();
        runner.run_until_idle().await.unwrap();

        assert_eq!(worker.call_count(), 1);
        assert_eq!(queue.dead().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_worker_is_dead() {
        let queue = MemoryJobQueue::new();
        let runner = runner(&queue, Arc::new(RecordingWorker::new()));

        queue.enqueue(NewJob::new("missing", json!([1]))).await.unwrap();
        assert_eq!(runner.run_until_idle().await.unwrap(), 1);

        let dead = queue.dead().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("unknown worker"));
    }

    #[tokio::test]
    async fn test_duplicates_collapse_into_one_follow_up() {
        let queue = MemoryJobQueue::new();
        let worker = Arc::new(RecordingWorker::deduplicated());
        let runner = runner(&queue, worker.clone());

        for _ in 0..5 {
            queue.enqueue(worker.job(json!([1]))).await.unwrap();
        }
        assert_eq!(queue.pending_len().await, 1);

        runner.run_until_idle().await.unwrap();
        assert_eq!(worker.call_count(), 2);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_follow_up_is_scheduled_after_delay() {
        let queue = MemoryJobQueue::new();
        let worker = Arc::new(RecordingWorker {
            deduplication: DeduplicationOptions::until_executing(),
            ..RecordingWorker::new()
        });
        let runner = runner(&queue, worker.clone());

        queue.enqueue(worker.job(json!([1]))).await.unwrap();
        queue.enqueue(worker.job(json!([1]))).await.unwrap();

        assert_eq!(runner.run_until_idle().await.unwrap(), 1);
        assert_eq!(worker.call_count(), 1);
        assert_eq!(queue.pending_len().await, 1);
        assert!(queue.next_run_at().await.unwrap() > Utc::now());

        // The scheduled follow-up absorbs further duplicates
        let dup = queue.enqueue(worker.job(json!([1]))).await.unwrap();
        assert!(dup.is_deduplicated());
    }

    #[tokio::test]
    async fn test_failed_job_still_reschedules() {
        let queue = MemoryJobQueue::new();
        let worker = Arc::new(RecordingWorker {
            deduplication: RecordingWorker::deduplicated().deduplication,
            ..RecordingWorker::failing(|| Error::InvalidInput("bad".into()))
        });
        let runner = runner(&queue, worker.clone());

        queue.enqueue(worker.job(json!([1]))).await.unwrap();
        queue.enqueue(worker.job(json!([1]))).await.unwrap();
        runner.run_until_idle().await.unwrap();

        assert_eq!(worker.call_count(), 2);
        assert_eq!(queue.dead().await.len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = MemoryJobQueue::new();
        let worker = Arc::new(RecordingWorker::new());
        let runner = runner(&queue, worker.clone());
        queue.enqueue(worker.job(json!([1]))).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { runner.run(rx).await });

        for _ in 0..100 {
            if queue.completed_len().await == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(worker.call_count(), 1);
    }

    /// Memory queue whose first `complete` fails.
    struct FlakyCompleteQueue {
        inner: MemoryJobQueue,
        failed: AtomicBool,
    }

    #[async_trait]
    impl JobQueue for FlakyCompleteQueue {
        async fn enqueue(&self, job: NewJob) -> DbResult<EnqueueOutcome> {
            self.inner.enqueue(job).await
        }

        async fn claim(&self, worker_id: &str) -> DbResult<Option<ClaimedJob>> {
            self.inner.claim(worker_id).await
        }

        async fn complete(&self, job: &ClaimedJob) -> DbResult<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(DbError::InvalidData("connection reset".into()));
            }
            self.inner.complete(job).await
        }

        async fn fail(
            &self,
            job: &ClaimedJob,
            error: &str,
            retry_at: Option<DateTime<Utc>>,
        ) -> DbResult<()> {
            self.inner.fail(job, error, retry_at).await
        }

        async fn release(&self, job: &ClaimedJob) -> DbResult<()> {
            self.inner.release(job).await
        }

        async fn requeue_stale(&self, older_than: Duration) -> DbResult<u64> {
            self.inner.requeue_stale(older_than).await
        }
    }

    #[tokio::test]
    async fn test_follow_up_enqueued_when_complete_fails() {
        let inner = MemoryJobQueue::new();
        let queue = Arc::new(FlakyCompleteQueue {
            inner: inner.clone(),
            failed: AtomicBool::new(false),
        });
        let worker = Arc::new(RecordingWorker::deduplicated());
        let runner = WorkerRunner::new(
            queue,
            WorkerRegistry::new().register(worker.clone()),
            WorkerConfig::default(),
        );

        inner.enqueue(worker.job(json!([1]))).await.unwrap();
        let dup = inner.enqueue(worker.job(json!([1]))).await.unwrap();
        assert!(dup.is_deduplicated());

        assert!(runner.run_once("worker-1").await.is_err());
        assert_eq!(worker.call_count(), 1);
        // The follow-up is queued and the unsettled job is back in line
        assert_eq!(inner.running_len().await, 0);
        assert_eq!(inner.pending_for("recording").await, 2);

        runner.run_until_idle().await.unwrap();
        assert!(worker.call_count() >= 3);
        assert_eq!(inner.pending_len().await, 0);
        assert_eq!(inner.running_len().await, 0);
        assert!(inner.dead().await.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_stale_uses_claim_timeout() {
        let queue = MemoryJobQueue::new();
        let worker = Arc::new(RecordingWorker::new());
        queue.enqueue(worker.job(json!([1]))).await.unwrap();
        queue.claim("crashed-worker").await.unwrap().unwrap();

        let patient = runner(&queue, worker.clone());
        assert_eq!(patient.requeue_stale().await.unwrap(), 0);
        assert_eq!(queue.running_len().await, 1);

        let eager = WorkerRunner::new(
            Arc::new(queue.clone()),
            WorkerRegistry::new().register(worker.clone()),
            WorkerConfig {
                claim_timeout_ms: 1,
                ..WorkerConfig::default()
            },
        );
        sleep(Duration::from_millis(5)).await;
        assert_eq!(eager.requeue_stale().await.unwrap(), 1);

        // The abandoned job runs again
        assert_eq!(eager.run_until_idle().await.unwrap(), 1);
        assert_eq!(worker.call_count(), 1);
        assert_eq!(queue.completed_len().await, 1);
        assert_eq!(queue.running_len().await, 0);
    }

    #[tokio::test]
    async fn test_run_reaps_abandoned_claims() {
        let queue = MemoryJobQueue::new();
        let worker = Arc::new(RecordingWorker::new());
        queue.enqueue(worker.job(json!([1]))).await.unwrap();
        queue.claim("crashed-worker").await.unwrap().unwrap();

        let runner = WorkerRunner::new(
            Arc::new(queue.clone()),
            WorkerRegistry::new().register(worker.clone()),
            WorkerConfig {
                poll_interval_ms: 10,
                claim_timeout_ms: 20,
                ..WorkerConfig::default()
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { runner.run(rx).await });

        for _ in 0..200 {
            if queue.completed_len().await == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(worker.call_count(), 1);
        assert_eq!(queue.completed_len().await, 1);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = WorkerRegistry::new().register(Arc::new(RecordingWorker::new()));
        assert!(registry.get("recording").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.names(), vec!["recording"]);
    }
}
