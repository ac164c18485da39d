//! Job queue backed by PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slotlock_db::DbResult;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::{ClaimedJob, EnqueueOutcome, JobQueue, NewJob};
use crate::dedup::dedup_key;

#[derive(Debug, sqlx::FromRow)]
struct ClaimedRow {
    id: Uuid,
    worker_name: String,
    args: serde_json::Value,
    attempt: i32,
    reschedule: bool,
}

impl From<ClaimedRow> for ClaimedJob {
    fn from(row: ClaimedRow) -> Self {
        Self {
            id: row.id,
            worker_name: row.worker_name,
            args: row.args,
            attempt: row.attempt,
            reschedule: row.reschedule,
        }
    }
}

/// Job queue in the `worker_jobs` table.
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    /// Insert the job. A pending job holding the same key absorbs the insert
    /// and, when rescheduling, gets its follow-up flag set.
    async fn enqueue(&self, job: NewJob) -> DbResult<EnqueueOutcome> {
        let now = Utc::now();
        let opts = job.deduplication;
        let key = opts
            .holds_key(job.is_scheduled(now))
            .then(|| dedup_key(&job.args));
        let job_id = Uuid::now_v7();

        let (id, reschedule): (Uuid, bool) = sqlx::query_as(
            r#"
            INSERT INTO worker_jobs (id, worker_name, args, status, dedup_key, reschedule, run_at, created_at)
            VALUES ($1, $2, $3, 'pending', $4, FALSE, COALESCE($5, NOW()), NOW())
            ON CONFLICT (worker_name, dedup_key) WHERE status = 'pending' AND dedup_key IS NOT NULL
            DO UPDATE SET reschedule = worker_jobs.reschedule OR $6
            RETURNING id, reschedule
            "#,
        )
        .bind(job_id)
        .bind(&job.worker_name)
        .bind(&job.args)
        .bind(key)
        .bind(job.run_at)
        .bind(opts.reschedules())
        .fetch_one(&self.pool)
        .await?;

        if id == job_id {
            Ok(EnqueueOutcome::Enqueued { job_id })
        } else {
            Ok(EnqueueOutcome::Deduplicated {
                existing: id,
                reschedule_pending: reschedule,
            })
        }
    }

    /// Claim the next due job.
    /// Uses SKIP LOCKED to prevent contention in distributed environments.
    async fn claim(&self, worker_id: &str) -> DbResult<Option<ClaimedJob>> {
        let row = sqlx::query_as::<_, ClaimedRow>(
            r#"
            UPDATE worker_jobs
            SET status = 'running', dedup_key = NULL, claimed_by = $1, claimed_at = NOW()
            WHERE id = (
                SELECT id FROM worker_jobs
                WHERE status = 'pending' AND run_at <= NOW()
                ORDER BY run_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, worker_name, args, attempt, reschedule
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ClaimedJob::from))
    }

    async fn complete(&self, job: &ClaimedJob) -> DbResult<()> {
        sqlx::query("UPDATE worker_jobs SET status = 'completed' WHERE id = $1")
            .bind(job.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        match retry_at {
            Some(run_at) => {
                sqlx::query(
                    r#"
                    UPDATE worker_jobs
                    SET status = 'pending', attempt = attempt + 1, run_at = $2, error = $3,
                        reschedule = FALSE, claimed_by = NULL, claimed_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(job.id)
                .bind(run_at)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("UPDATE worker_jobs SET status = 'dead', error = $2 WHERE id = $1")
                    .bind(job.id)
                    .bind(error)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn release(&self, job: &ClaimedJob) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE worker_jobs
            SET status = 'pending', run_at = NOW(), claimed_by = NULL, claimed_at = NULL
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recover jobs whose worker died or lost its connection mid-run.
    async fn requeue_stale(&self, older_than: Duration) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE worker_jobs
            SET status = 'pending', run_at = NOW(), claimed_by = NULL, claimed_at = NULL
            WHERE status = 'running'
              AND claimed_at <= NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
