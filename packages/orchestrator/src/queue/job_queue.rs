//! Durable, priority-aware work queue. One named queue, `github-jobs`,
//! carries one queued entry per Delegated Job; the queue is generic
//! infrastructure, the Delegated Job table (`storage::models::DelegatedJob`)
//! is the domain row it wraps.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

pub const GITHUB_JOBS_QUEUE: &str = "github-jobs";
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const COMPLETED_MAX_AGE_SECS: i64 = 24 * 60 * 60;
const COMPLETED_KEEP_COUNT: i64 = 500;
const FAILED_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum QueuedJobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
}

#[derive(Debug, Clone, FromRow)]
pub struct QueuedJob {
    pub id: Uuid,
    pub queue_name: String,
    pub payload: Value,
    pub priority: i32,
    pub status: QueuedJobStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub payload: Value,
    pub attempt: i32,
}

const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_LEASE_SECS: i64 = 60;

pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn add(&self, queue_name: &str, payload: Value, priority: i32) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO queued_jobs (id, queue_name, payload, priority, status, attempt,
                                      max_attempts, next_run_at, lease_expires_at, worker_id,
                                      last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, NULL, NULL, NULL, $6, $6)
            "#,
        )
        .bind(id)
        .bind(queue_name)
        .bind(&payload)
        .bind(priority)
        .bind(DEFAULT_MAX_ATTEMPTS)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(id)
    }

    /// Atomically claims up to `batch_size` ready jobs from `queue_name`,
    /// ordered by priority then age, skipping rows locked by other workers.
    pub async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
        batch_size: i64,
    ) -> Result<Vec<ClaimedJob>> {
        let now = Utc::now();
        let lease_expires_at = now + ChronoDuration::seconds(DEFAULT_LEASE_SECS);

        let rows = sqlx::query_as::<_, QueuedJob>(
            r#"
            WITH candidates AS (
                SELECT id FROM queued_jobs
                WHERE queue_name = $1
                  AND status = 'pending'
                  AND next_run_at <= $2
                ORDER BY priority DESC, created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queued_jobs
            SET status = 'running', worker_id = $4, lease_expires_at = $5, updated_at = $2
            WHERE id IN (SELECT id FROM candidates)
            RETURNING *
            "#,
        )
        .bind(queue_name)
        .bind(now)
        .bind(batch_size)
        .bind(worker_id)
        .bind(lease_expires_at)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| ClaimedJob { id: r.id, payload: r.payload, attempt: r.attempt })
            .collect())
    }

    pub async fn mark_succeeded(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE queued_jobs SET status = 'succeeded', lease_expires_at = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    /// Exponential backoff starting at 2s, capped per attempt; once
    /// `attempt >= max_attempts` the job moves to the dead letter state
    /// instead of being retried.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, QueuedJob>("SELECT * FROM queued_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?
            .ok_or_else(|| OrchestratorError::Conflict(format!("queued job {id} not found")))?;

        let next_attempt = row.attempt + 1;

        if next_attempt >= row.max_attempts {
            sqlx::query(
                "UPDATE queued_jobs SET status = 'dead_letter', attempt = $1, last_error = $2, lease_expires_at = NULL, updated_at = now() WHERE id = $3",
            )
            .bind(next_attempt)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
            return Ok(false);
        }

        let backoff_secs = 2i64.saturating_pow(next_attempt as u32).min(3600);
        let next_run_at = Utc::now() + ChronoDuration::seconds(backoff_secs);

        sqlx::query(
            "UPDATE queued_jobs SET status = 'pending', attempt = $1, next_run_at = $2, last_error = $3, lease_expires_at = NULL, updated_at = now() WHERE id = $4",
        )
        .bind(next_attempt)
        .bind(next_run_at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(true)
    }

    /// Retention sweep: completed rows older than `completed_max_age` beyond
    /// the most recent `completed_keep_count`, plus failed/dead-letter rows
    /// older than `failed_max_age`.
    pub async fn prune(
        &self,
        queue_name: &str,
        completed_max_age: ChronoDuration,
        completed_keep_count: i64,
        failed_max_age: ChronoDuration,
    ) -> Result<u64> {
        let completed_cutoff = Utc::now() - completed_max_age;
        let failed_cutoff = Utc::now() - failed_max_age;

        let result = sqlx::query(
            r#"
            DELETE FROM queued_jobs
            WHERE queue_name = $1
              AND (
                (status = 'succeeded' AND updated_at < $2 AND id NOT IN (
                    SELECT id FROM queued_jobs WHERE queue_name = $1 AND status = 'succeeded'
                    ORDER BY updated_at DESC LIMIT $3
                ))
                OR (status IN ('failed', 'dead_letter') AND updated_at < $4)
              )
            "#,
        )
        .bind(queue_name)
        .bind(completed_cutoff)
        .bind(completed_keep_count)
        .bind(failed_cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Runs [`Self::prune`] against `queue_name` on [`PRUNE_INTERVAL`], using
    /// the default retention windows.
    pub async fn run_prune_loop(&self, queue_name: &str) {
        loop {
            tokio::time::sleep(PRUNE_INTERVAL).await;
            match self
                .prune(
                    queue_name,
                    ChronoDuration::seconds(COMPLETED_MAX_AGE_SECS),
                    COMPLETED_KEEP_COUNT,
                    ChronoDuration::seconds(FAILED_MAX_AGE_SECS),
                )
                .await
            {
                Ok(removed) if removed > 0 => info!(removed, queue_name, "pruned queued jobs"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, queue_name, "queue prune failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        for attempt in 1..20u32 {
            let backoff = 2i64.saturating_pow(attempt).min(3600);
            assert!(backoff <= 3600);
        }
        assert_eq!(2i64.saturating_pow(1).min(3600), 2);
        assert_eq!(2i64.saturating_pow(12).min(3600), 3600);
    }
}
