//! Typed access to the relational store and the key/value broker.
//!
//! All cross-row mutations (assigning a runner to a job, scaling a pool)
//! run inside a transaction. Reads may be served from a replica when one is
//! configured; writes always go to the primary.

use chrono::Utc;
use redis::aio::ConnectionManager;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::models::*;
use crate::error::{OrchestratorError, Result};

pub struct StorageGateway {
    primary: PgPool,
    replica: Option<PgPool>,
    kv: ConnectionManager,
}

impl StorageGateway {
    pub async fn connect(database_url: &str, replica_url: Option<&str>, redis_url: &str) -> anyhow::Result<Self> {
        let primary = PgPool::connect(database_url).await?;
        let replica = match replica_url {
            Some(url) => Some(PgPool::connect(url).await?),
            None => None,
        };
        sqlx::migrate!("./migrations").run(&primary).await?;

        let redis_client = redis::Client::open(redis_url)?;
        let kv = ConnectionManager::new(redis_client).await?;

        Ok(Self { primary, replica, kv })
    }

    pub fn read_pool(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    pub fn write_pool(&self) -> &PgPool {
        &self.primary
    }

    pub fn kv(&self) -> ConnectionManager {
        self.kv.clone()
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        self.primary
            .begin()
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))
    }

    pub async fn health_check(&self) -> Result<()> {
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            sqlx::query("SELECT 1").execute(self.read_pool()),
        )
        .await
        .map_err(|_| OrchestratorError::Transient("database health check timed out".into()))?
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    pub fn pool_size(&self) -> u32 {
        self.primary.size()
    }

    pub fn pool_idle(&self) -> usize {
        self.primary.num_idle()
    }

    // ---- Delegated Job ----------------------------------------------

    pub async fn insert_job(&self, job: &DelegatedJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_id, run_id, repository, workflow_name, labels, head_sha,
                               status, runner_id, created_at, started_at, completed_at,
                               exit_code, error, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (job_id, run_id) DO UPDATE SET
                status = EXCLUDED.status,
                labels = EXCLUDED.labels,
                priority = EXCLUDED.priority
            "#,
        )
        .bind(job.id)
        .bind(job.job_id)
        .bind(job.run_id)
        .bind(&job.repository)
        .bind(&job.workflow_name)
        .bind(&job.labels)
        .bind(&job.head_sha)
        .bind(job.status)
        .bind(job.runner_id)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.exit_code)
        .bind(&job.error)
        .bind(job.priority)
        .execute(self.write_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    pub async fn find_job_by_forge_ids(&self, job_id: i64, run_id: i64) -> Result<Option<DelegatedJob>> {
        sqlx::query_as::<_, DelegatedJob>(
            "SELECT * FROM jobs WHERE job_id = $1 AND run_id = $2",
        )
        .bind(job_id)
        .bind(run_id)
        .fetch_optional(self.read_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))
    }

    pub async fn find_job(&self, id: Uuid) -> Result<Option<DelegatedJob>> {
        sqlx::query_as::<_, DelegatedJob>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.read_pool())
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))
    }

    /// Transitions a job's status, rejecting any transition that would move
    /// it backward through the DAG.
    pub async fn transition_job_status(
        &self,
        id: Uuid,
        next: JobStatus,
        runner_id: Option<Uuid>,
    ) -> Result<()> {
        let mut tx = self.begin().await?;

        let current = sqlx::query_as::<_, DelegatedJob>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?
            .ok_or_else(|| OrchestratorError::Conflict(format!("job {id} not found")))?;

        if !current.validate_transition(next) {
            return Err(OrchestratorError::Conflict(format!(
                "cannot transition job {id} from {:?} to {:?}",
                current.status, next
            )));
        }

        let now = Utc::now();
        let (started_at, completed_at) = match next {
            JobStatus::Running => (Some(now), current.completed_at),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                (current.started_at, Some(now))
            }
            _ => (current.started_at, current.completed_at),
        };

        sqlx::query(
            "UPDATE jobs SET status = $1, runner_id = COALESCE($2, runner_id), started_at = $3, completed_at = $4 WHERE id = $5",
        )
        .bind(next)
        .bind(runner_id)
        .bind(started_at)
        .bind(completed_at)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        tx.commit().await.map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    // ---- Runner -------------------------------------------------------

    pub async fn insert_runner(&self, runner: &Runner) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runners (id, name, runner_type, repository, labels, status,
                                  container_id, current_job_id, last_heartbeat, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(runner.id)
        .bind(&runner.name)
        .bind(runner.runner_type)
        .bind(&runner.repository)
        .bind(&runner.labels)
        .bind(runner.status)
        .bind(&runner.container_id)
        .bind(runner.current_job_id)
        .bind(runner.last_heartbeat)
        .bind(runner.updated_at)
        .execute(self.write_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    pub async fn get_active_runners(&self, repository: &str) -> Result<Vec<Runner>> {
        sqlx::query_as::<_, Runner>(
            "SELECT * FROM runners WHERE repository = $1 AND status != 'offline'",
        )
        .bind(repository)
        .fetch_all(self.read_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))
    }

    /// Looks up a runner by its registered name, the only identifier the
    /// forge's `workflow_job` event shares with our own Runner rows.
    pub async fn find_runner_by_name(&self, name: &str) -> Result<Option<Runner>> {
        sqlx::query_as::<_, Runner>("SELECT * FROM runners WHERE name = $1")
            .bind(name)
            .fetch_optional(self.read_pool())
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))
    }

    pub async fn set_runner_status(
        &self,
        id: Uuid,
        status: RunnerStatus,
        current_job_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runners SET status = $1, current_job_id = $2, updated_at = now() WHERE id = $3",
        )
        .bind(status)
        .bind(current_job_id)
        .bind(id)
        .execute(self.write_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    /// Clears `container_id` on a Runner and deletes it if it is Ephemeral
    /// and Idle — the container-removal invariant requires a later inspect
    /// to report "not found" and the runner row to drop its container_id.
    pub async fn release_runner_container(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE runners SET container_id = NULL WHERE id = $1")
            .bind(id)
            .execute(self.write_pool())
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    pub async fn delete_runner(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM runners WHERE id = $1")
            .bind(id)
            .execute(self.write_pool())
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    // ---- Runner Pool ---------------------------------------------------

    pub async fn get_or_create_pool(&self, repository: &str) -> Result<RunnerPool> {
        if let Some(pool) = sqlx::query_as::<_, RunnerPool>(
            "SELECT * FROM runner_pools WHERE repository = $1",
        )
        .bind(repository)
        .fetch_optional(self.read_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?
        {
            return Ok(pool);
        }

        let default_pool = RunnerPool::new_default(repository);
        sqlx::query(
            r#"
            INSERT INTO runner_pools (repository, min_runners, max_runners, scale_increment, scale_threshold, last_scaled_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (repository) DO NOTHING
            "#,
        )
        .bind(&default_pool.repository)
        .bind(default_pool.min_runners)
        .bind(default_pool.max_runners)
        .bind(default_pool.scale_increment)
        .bind(default_pool.scale_threshold)
        .bind(default_pool.last_scaled_at)
        .execute(self.write_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(default_pool)
    }

    pub async fn set_pool_runner_count_marker(&self, repository: &str) -> Result<()> {
        sqlx::query("UPDATE runner_pools SET last_scaled_at = now() WHERE repository = $1")
            .bind(repository)
            .execute(self.write_pool())
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    /// Repositories with a pool row, for the Auto-Scaler's tick loop.
    pub async fn distinct_pool_repositories(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT repository FROM runner_pools")
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(rows.into_iter().map(|(repository,)| repository).collect())
    }

    // ---- Routing Rules / Decisions -------------------------------------

    pub async fn list_enabled_routing_rules(&self) -> Result<Vec<RoutingRule>> {
        let rows = sqlx::query_as::<_, RoutingRuleRow>(
            "SELECT * FROM routing_rules WHERE enabled = true ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(self.read_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        rows.into_iter()
            .map(|r| RoutingRule::try_from(r).map_err(|e| OrchestratorError::Transient(e.to_string())))
            .collect()
    }

    pub async fn insert_routing_decision(
        &self,
        job_id: Uuid,
        rule_id: Option<Uuid>,
        target_count: i32,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO routing_decisions (id, job_id, rule_id, target_count, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(rule_id)
        .bind(target_count)
        .bind(Utc::now())
        .execute(self.write_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    // ---- Webhook Events -------------------------------------------------

    /// Inserts the event row; the insert is the linearization point for
    /// dedup. Returns `false` if the `delivery_id` already exists.
    pub async fn insert_webhook_event(&self, event: &WebhookEventRow) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (id, repository, event, action, payload, signature,
                                         timestamp, processed, processing_attempts,
                                         last_processing_error, processing_duration_ms, dedup_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.repository)
        .bind(&event.event)
        .bind(&event.action)
        .bind(&event.payload)
        .bind(&event.signature)
        .bind(event.timestamp)
        .bind(event.processed)
        .bind(event.processing_attempts)
        .bind(&event.last_processing_error)
        .bind(event.processing_duration_ms)
        .bind(&event.dedup_key)
        .execute(self.write_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_webhook_event(&self, delivery_id: &str) -> Result<Option<WebhookEventRow>> {
        sqlx::query_as::<_, WebhookEventRow>("SELECT * FROM webhook_events WHERE id = $1")
            .bind(delivery_id)
            .fetch_optional(self.read_pool())
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))
    }

    pub async fn mark_webhook_outcome(
        &self,
        delivery_id: &str,
        processed: bool,
        error: Option<&str>,
        duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = $1,
                last_processing_error = $2,
                processing_duration_ms = $3,
                processing_attempts = processing_attempts + 1
            WHERE id = $4
            "#,
        )
        .bind(processed)
        .bind(error)
        .bind(duration_ms)
        .bind(delivery_id)
        .execute(self.write_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    // ---- Workflow Runs / stats ------------------------------------------

    pub async fn upsert_workflow_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (run_id, repository, workflow_name, head_branch, head_sha,
                                        event, status, conclusion, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (run_id) DO UPDATE SET
                status = EXCLUDED.status,
                conclusion = EXCLUDED.conclusion,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(run.run_id)
        .bind(&run.repository)
        .bind(&run.workflow_name)
        .bind(&run.head_branch)
        .bind(&run.head_sha)
        .bind(&run.event)
        .bind(&run.status)
        .bind(&run.conclusion)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(self.write_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }

    // ---- Auto-Scaler inputs ---------------------------------------------

    /// Count of jobs Pending in the last 5 minutes for `repository`.
    pub async fn queue_depth(&self, repository: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE repository = $1 AND status = 'pending' AND created_at > now() - interval '5 minutes'",
        )
        .bind(repository)
        .fetch_one(self.read_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(row.0)
    }

    /// Average wait time in seconds across the same Pending set.
    pub async fn avg_wait_seconds(&self, repository: &str) -> Result<f64> {
        let row: (Option<f64>,) = sqlx::query_as(
            "SELECT EXTRACT(EPOCH FROM AVG(now() - created_at)) FROM jobs WHERE repository = $1 AND status = 'pending' AND created_at > now() - interval '5 minutes'",
        )
        .bind(repository)
        .fetch_one(self.read_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(row.0.unwrap_or(0.0))
    }

    pub async fn active_jobs_count(&self, repository: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE repository = $1 AND status IN ('assigned', 'running')",
        )
        .bind(repository)
        .fetch_one(self.read_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(row.0)
    }

    pub async fn bump_repository_stats(&self, repository: &str, success: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repository_stats (repository, total_jobs, successful_jobs, failed_jobs, last_job_at)
            VALUES ($1, 1, $2, $3, now())
            ON CONFLICT (repository) DO UPDATE SET
                total_jobs = repository_stats.total_jobs + 1,
                successful_jobs = repository_stats.successful_jobs + $2,
                failed_jobs = repository_stats.failed_jobs + $3,
                last_job_at = now()
            "#,
        )
        .bind(repository)
        .bind(if success { 1i64 } else { 0 })
        .bind(if success { 0i64 } else { 1 })
        .execute(self.write_pool())
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(())
    }
}
