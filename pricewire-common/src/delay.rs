//! Delay queue adapter
//!
//! Delayed job submission with caller-supplied unique ids and a bounded
//! pending size. Jobs are claimed one-by-one with a compare-and-set state
//! transition, so concurrent consumers never double-run a job; execution
//! concurrency is capped by a semaphore.

use crate::error::WorkerError;
use crate::shutdown::ShutdownCoordinator;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Default cap on waiting jobs per queue; `add` rejects above it
const DEFAULT_MAX_PENDING: i64 = 10_000;

/// How often the consumer looks for due jobs
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Delay before a transiently failed job becomes due again
const RETRY_BACKOFF_MS: i64 = 30_000;

/// Execution attempts before a job is parked as failed
const MAX_JOB_ATTEMPTS: i64 = 3;

/// One claimed delayed job
#[derive(Debug, Clone)]
pub struct DelayedJob {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    pub unique_id: Option<String>,
    pub run_at_ms: i64,
    pub attempts: i64,
}

/// Handler for claimed jobs; the error class picks retry vs park
#[async_trait]
pub trait DelayedJobHandler: Send + Sync {
    async fn handle(&self, job: &DelayedJob) -> std::result::Result<(), WorkerError>;
}

#[derive(Clone)]
pub struct DelayQueue {
    pool: SqlitePool,
    max_pending: i64,
}

impl DelayQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    pub fn with_max_pending(pool: SqlitePool, max_pending: i64) -> Self {
        Self { pool, max_pending }
    }

    /// Submit a job to run after `delay_ms`.
    ///
    /// Returns `Ok(false)` when `unique_id` already exists (dedup), and
    /// `Error::QueueFull` when the queue's waiting backlog is at capacity;
    /// callers treat that as transient backpressure.
    pub async fn add(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        delay_ms: u64,
        unique_id: Option<&str>,
    ) -> Result<bool> {
        let (pending,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM delayed_jobs WHERE queue = ? AND state = 'waiting'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        if pending >= self.max_pending {
            return Err(Error::QueueFull(format!(
                "{queue} has {pending} waiting jobs"
            )));
        }

        let run_at_ms = Utc::now().timestamp_millis() + delay_ms as i64;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO delayed_jobs (queue, unique_id, payload, run_at_ms)
             VALUES (?, ?, ?, ?)",
        )
        .bind(queue)
        .bind(unique_id)
        .bind(payload.to_string())
        .bind(run_at_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Number of jobs waiting in `queue`
    pub async fn pending(&self, queue: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM delayed_jobs WHERE queue = ? AND state = 'waiting'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Waiting jobs of a queue, soonest first (inspection/tests)
    pub async fn waiting_jobs(&self, queue: &str) -> Result<Vec<DelayedJob>> {
        let rows: Vec<(i64, Option<String>, String, i64, i64)> = sqlx::query_as(
            "SELECT id, unique_id, payload, run_at_ms, attempts FROM delayed_jobs
             WHERE queue = ? AND state = 'waiting' ORDER BY run_at_ms, id",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (id, unique_id, payload, run_at_ms, attempts) in rows {
            jobs.push(DelayedJob {
                id,
                queue: queue.to_string(),
                payload: serde_json::from_str(&payload)?,
                unique_id,
                run_at_ms,
                attempts,
            });
        }
        Ok(jobs)
    }

    /// Consume `queue` until shutdown, running up to `concurrency` jobs at
    /// once.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DelayedJobHandler>,
        concurrency: usize,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        info!(queue, concurrency, "delay queue consumer started");

        while !shutdown.is_shutdown() {
            let claimed = match self.claim_due(queue, concurrency).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(queue, error = %e, "job claim failed");
                    self.sleep_cooperatively(&shutdown).await;
                    continue;
                }
            };

            if claimed.is_empty() {
                self.sleep_cooperatively(&shutdown).await;
                continue;
            }

            for job in claimed {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let this = self.clone();
                let handler = Arc::clone(&handler);
                let guard = shutdown.begin_operation();
                tokio::spawn(async move {
                    this.run_job(&job, handler.as_ref()).await;
                    drop(guard);
                    drop(permit);
                });
            }
        }

        // Wait for spawned jobs to finish before reporting stopped.
        let _ = semaphore.acquire_many(concurrency as u32).await;
        info!(queue, "delay queue consumer stopped");
        Ok(())
    }

    /// Claim up to `limit` due jobs with waiting→active transitions
    async fn claim_due(&self, queue: &str, limit: usize) -> Result<Vec<DelayedJob>> {
        let now_ms = Utc::now().timestamp_millis();
        let rows: Vec<(i64, Option<String>, String, i64, i64)> = sqlx::query_as(
            "SELECT id, unique_id, payload, run_at_ms, attempts FROM delayed_jobs
             WHERE queue = ? AND state = 'waiting' AND run_at_ms <= ?
             ORDER BY run_at_ms, id LIMIT ?",
        )
        .bind(queue)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for (id, unique_id, payload, run_at_ms, attempts) in rows {
            let result = sqlx::query(
                "UPDATE delayed_jobs SET state = 'active', attempts = attempts + 1
                 WHERE id = ? AND state = 'waiting'",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                claimed.push(DelayedJob {
                    id,
                    queue: queue.to_string(),
                    payload: serde_json::from_str(&payload)?,
                    unique_id,
                    run_at_ms,
                    attempts: attempts + 1,
                });
            }
        }
        Ok(claimed)
    }

    async fn run_job(&self, job: &DelayedJob, handler: &dyn DelayedJobHandler) {
        match handler.handle(job).await {
            Ok(()) => {
                debug!(queue = %job.queue, job_id = job.id, "job completed");
                self.finish_job(job.id, "done").await;
            }
            Err(err) if err.is_retryable() && job.attempts < MAX_JOB_ATTEMPTS => {
                warn!(queue = %job.queue, job_id = job.id, attempt = job.attempts,
                      error = %err, "job failed, rescheduling");
                self.reschedule_job(job.id).await;
            }
            Err(err) => {
                warn!(queue = %job.queue, job_id = job.id, attempts = job.attempts,
                      error = %err, "job parked as failed");
                self.finish_job(job.id, "failed").await;
            }
        }
    }

    async fn finish_job(&self, id: i64, state: &str) {
        let result = sqlx::query("UPDATE delayed_jobs SET state = ? WHERE id = ?")
            .bind(state)
            .bind(id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            warn!(job_id = id, error = %e, "job state update failed");
        }
    }

    async fn reschedule_job(&self, id: i64) {
        let run_at_ms = Utc::now().timestamp_millis() + RETRY_BACKOFF_MS;
        let result = sqlx::query(
            "UPDATE delayed_jobs SET state = 'waiting', run_at_ms = ? WHERE id = ?",
        )
        .bind(run_at_ms)
        .bind(id)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!(job_id = id, error = %e, "job reschedule failed");
        }
    }

    async fn sleep_cooperatively(&self, shutdown: &ShutdownCoordinator) {
        tokio::select! {
            _ = sleep(CLAIM_POLL_INTERVAL) => {}
            _ = shutdown.wait() => {}
        }
    }
}
