//! Database-backed job queue
//!
//! One logical queue of (stream, block) deliveries. Claims take a row-level
//! lock with skip-locked so concurrent workers never double-claim; stale
//! claims from crashed workers are recovered back to pending on a timer.

use chrono::Duration as ChronoDuration;
use chrono::Utc;
use sqlx::{PgConnection, PgExecutor, PgPool, QueryBuilder};
use tracing::{debug, info};
use uuid::Uuid;

use secondlayer_core::notify::NEW_JOB_CHANNEL;
use secondlayer_core::types::JobRecord;
use secondlayer_core::Result;

use crate::Store;

const JOB_COLUMNS: &str = "id, stream_id, block_height, status, attempts, locked_at, locked_by, \
                           last_error, backfill, next_retry_at, created_at, completed_at";

/// Queue handle bound to the shared store
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Idempotent insert of one pending job per (stream, block). Returns the
    /// number of rows actually created.
    pub async fn enqueue_batch(
        &self,
        conn: &mut PgConnection,
        stream_ids: &[Uuid],
        block_height: i64,
        backfill: bool,
    ) -> Result<u64> {
        if stream_ids.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new("INSERT INTO jobs (stream_id, block_height, backfill) ");
        qb.push_values(stream_ids, |mut b, stream_id| {
            b.push_bind(stream_id);
            b.push_bind(block_height);
            b.push_bind(backfill);
        });
        qb.push(" ON CONFLICT (stream_id, block_height) DO NOTHING");

        let inserted = qb.build().execute(&mut *conn).await?.rows_affected();
        debug!(block_height, inserted, "Enqueued jobs");
        Ok(inserted)
    }

    /// Wake idle workers. One notification per enqueue batch; subscribers
    /// coalesce by draining until claim returns nothing.
    pub async fn notify_new_job(&self) -> Result<()> {
        self.store.notify(NEW_JOB_CHANNEL, "").await
    }

    /// Claim a single pending job for this worker. Lowest block first, then
    /// oldest; rows locked by other transactions are skipped. Retried jobs
    /// stay invisible until their next_retry_at passes.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            UPDATE jobs SET
                status = 'processing',
                locked_at = now(),
                locked_by = $1,
                attempts = attempts + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= now())
                ORDER BY block_height ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(job)
    }

    /// Mark a claimed job done
    pub async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = now(), locked_at = NULL, locked_by = NULL
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Mark a claimed job failed with a reason. Whether it runs again is the
    /// caller's decision (see `requeue`).
    pub async fn fail(&self, job_id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', last_error = $2, locked_at = NULL, locked_by = NULL
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(reason)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Put a failed job back in the queue, claimable after `delay`
    pub async fn requeue(&self, job_id: i64, delay: std::time::Duration) -> Result<()> {
        let next_retry_at =
            Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::hours(1));
        sqlx::query(
            "UPDATE jobs SET status = 'pending', next_retry_at = $2 WHERE id = $1",
        )
        .bind(job_id)
        .bind(next_retry_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Promote stale processing claims back to pending. Covers workers that
    /// died mid-job. Returns the number of recovered rows.
    pub async fn recover(&self, stale_after: std::time::Duration) -> Result<u64> {
        let recovered = sqlx::query(
            "UPDATE jobs SET status = 'pending', locked_at = NULL, locked_by = NULL
             WHERE status = 'processing' AND locked_at < now() - ($1 * INTERVAL '1 second')",
        )
        .bind(stale_after.as_secs() as f64)
        .execute(self.pool())
        .await?
        .rows_affected();

        if recovered > 0 {
            info!(recovered, "Recovered stale job claims");
            self.notify_new_job().await?;
        }
        Ok(recovered)
    }

    /// Fail every pending or processing job at a height. Used by reorg
    /// handling inside the ingest transaction.
    pub async fn fail_jobs_at_height<'e, E>(executor: E, height: i64, reason: &str) -> Result<u64>
    where
        E: PgExecutor<'e>,
    {
        let failed = sqlx::query(
            "UPDATE jobs SET status = 'failed', last_error = $2, locked_at = NULL, locked_by = NULL
             WHERE block_height = $1 AND status IN ('pending', 'processing')",
        )
        .bind(height)
        .bind(reason)
        .execute(executor)
        .await?
        .rows_affected();
        Ok(failed)
    }

    /// A single job by id
    pub async fn get(&self, job_id: i64) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(job)
    }

    /// Row counts per status, for operators
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// Queue depth by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}
