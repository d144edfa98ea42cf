//! Ties the Job Router, Container Lifecycle Manager, Network Isolation, and
//! Forge Client together into `execute_job`'s ten-step sequence. Failure at
//! any step past runner-row creation triggers a best-effort stop+remove of
//! whatever container exists and marks the job Failed.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::common::network_name::sanitize;
use crate::containers::{ContainerCreateSpec, ContainerLifecycleManager};
use crate::error::{OrchestratorError, Result};
use crate::events::{DelegatedJobEvent, EventBus};
use crate::network::NetworkIsolation;
use crate::router::JobRouter;
use crate::storage::models::{DelegatedJob, JobStatus, Runner, RunnerStatus, RunnerType};
use crate::storage::StorageGateway;
use forge_client::ForgeClient;

/// Default deadline for a single job's container run (§4.8 step 9).
pub const DEFAULT_JOB_DEADLINE: Duration = Duration::from_secs(60 * 60);
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Ephemeral runner containers are swept this long after their job completes.
pub const CONTAINER_CLEANUP_DELAY: Duration = Duration::from_secs(5 * 60);

/// Runners whose job has reached a terminal state, pending the delayed
/// container sweep in [`run_ephemeral_cleanup`]. Shared between `Orchestrator`
/// and the background sweep task.
pub type PendingCleanup = Arc<RwLock<HashMap<Uuid, (String, Instant)>>>;

pub struct Orchestrator {
    storage: Arc<StorageGateway>,
    router: Arc<JobRouter>,
    lifecycle: Arc<ContainerLifecycleManager>,
    network: Arc<NetworkIsolation>,
    forge: Arc<ForgeClient>,
    events: EventBus,
    runner_image: String,
    job_deadline: Duration,
    pending_cleanup: PendingCleanup,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<StorageGateway>,
        router: Arc<JobRouter>,
        lifecycle: Arc<ContainerLifecycleManager>,
        network: Arc<NetworkIsolation>,
        forge: Arc<ForgeClient>,
        events: EventBus,
        runner_image: String,
    ) -> Self {
        Self {
            storage,
            router,
            lifecycle,
            network,
            forge,
            events,
            runner_image,
            job_deadline: DEFAULT_JOB_DEADLINE,
            pending_cleanup: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Shared handle the composition root passes to [`run_ephemeral_cleanup`]
    /// so the background sweep sees runners this orchestrator marks done.
    pub fn pending_cleanup(&self) -> PendingCleanup {
        self.pending_cleanup.clone()
    }

    pub async fn execute_job(&self, job: DelegatedJob) -> Result<()> {
        let started_at = std::time::Instant::now();

        match self.run(&job).await {
            Ok(outcome) => {
                let next = if outcome.success { JobStatus::Completed } else { JobStatus::Failed };
                self.storage.transition_job_status(job.id, next, None).await?;
                self.storage.bump_repository_stats(&job.repository, outcome.success).await?;
                self.events.publish(DelegatedJobEvent::Completed {
                    job_id: job.id,
                    exit_code: outcome.exit_code,
                    duration_ms: started_at.elapsed().as_millis() as i64,
                });
                if outcome.exit_code != 0 {
                    info!(job_id = %job.id, exit_code = outcome.exit_code, "job container exited non-zero");
                }
                // Always release the locally tracked Runner once its job is
                // terminal: hand its container off to the delayed sweep
                // instead of deleting the row here, so logs stay fetchable
                // for a short window after completion.
                self.pending_cleanup
                    .write()
                    .await
                    .insert(outcome.runner_id, (outcome.container_id, Instant::now()));
                Ok(())
            }
            Err((e, runner)) => {
                if let Some((runner_id, container_id)) = runner {
                    if let Err(cleanup_err) = self.best_effort_teardown(&container_id).await {
                        warn!(job_id = %job.id, error = %cleanup_err, "failed to tear down container after job failure");
                    }
                    if let Err(cleanup_err) = self.storage.delete_runner(runner_id).await {
                        warn!(job_id = %job.id, %runner_id, error = %cleanup_err, "failed to delete runner row after job failure");
                    }
                }

                if job.validate_transition(JobStatus::Failed) {
                    let _ = self.storage.transition_job_status(job.id, JobStatus::Failed, None).await;
                }
                self.events.publish(DelegatedJobEvent::Failed { job_id: job.id, error: e.to_string() });
                error!(job_id = %job.id, error = %e, "job execution failed");
                Err(e)
            }
        }
    }

    /// The ten-step sequence. Returns either a successful outcome or an
    /// error paired with whatever (runner id, container id) pair had already
    /// been created, so the caller can tear both down.
    async fn run(&self, job: &DelegatedJob) -> std::result::Result<JobOutcome, (OrchestratorError, Option<(Uuid, String)>)> {
        // 1. Assigned.
        self.storage
            .transition_job_status(job.id, JobStatus::Assigned, None)
            .await
            .map_err(|e| (e, None))?;

        // 2. Routing decision.
        let decision = self
            .router
            .route_job(&job.repository, &job.workflow_name, "", "workflow_job", &job.labels_vec())
            .await
            .map_err(|e| (e, None))?;
        self.storage
            .insert_routing_decision(job.id, decision.rule_id, decision.target_runners.len() as i32)
            .await
            .map_err(|e| (e, None))?;

        // 3. Ephemeral runner row.
        let short_id = Uuid::new_v4().to_string()[..8].to_string();
        let runner_name = format!("ephemeral-{}-{short_id}", sanitize(&job.repository));
        let runner = Runner::builder()
            .id(Uuid::new_v4())
            .name(runner_name.clone())
            .runner_type(RunnerType::Ephemeral)
            .repository(job.repository.clone())
            .labels(serde_json::json!(job.labels_vec()))
            .status(RunnerStatus::Starting)
            .current_job_id(job.id)
            .last_heartbeat(Utc::now())
            .updated_at(Utc::now())
            .build();
        self.storage.insert_runner(&runner).await.map_err(|e| (e, None))?;

        // 4. Runner registration token.
        let token = self
            .forge
            .generate_runner_token(&job.repository)
            .await
            .map_err(OrchestratorError::from)
            .map_err(|e| (e, None))?;

        // 5. Image scanning is a trait seam only (Non-goal); nothing to call here.

        // 6. Container config.
        let network = self.network.ensure_network(&job.repository).await.map_err(|e| (e, None))?;
        let env = vec![
            format!("RUNNER_TOKEN={}", token.token),
            "RUNNER_EPHEMERAL=true".to_string(),
            format!("RUNNER_LABELS={}", job.labels_vec().join(",")),
            format!("REPOSITORY_URL=https://github.com/{}", job.repository),
            format!("FORGE_JOB_ID={}", job.job_id),
            format!("FORGE_RUN_ID={}", job.run_id),
        ];
        let spec = ContainerCreateSpec {
            image: self.runner_image.clone(),
            env,
            network: Some(network),
            network_alias: Some(runner_name.clone()),
        };

        // 7. Create and start.
        let container_id = self
            .lifecycle
            .create_container(runner.id, job.id, spec)
            .await
            .map_err(|e| (e, None))?;
        let runner_and_container = (runner.id, container_id.clone());
        self.lifecycle
            .start(&container_id)
            .await
            .map_err(|e| (e, Some(runner_and_container.clone())))?;
        self.storage
            .set_runner_status(runner.id, RunnerStatus::Busy, Some(job.id))
            .await
            .map_err(|e| (e, Some(runner_and_container.clone())))?;

        // 8. Running.
        self.storage
            .transition_job_status(job.id, JobStatus::Running, Some(runner.id))
            .await
            .map_err(|e| (e, Some(runner_and_container.clone())))?;
        self.events.publish(DelegatedJobEvent::Running {
            job_id: job.id,
            runner_id: runner.id,
            started_at: Utc::now(),
        });

        // 9. Poll until the container stops or the job reaches a terminal
        // state, bounded by the overall deadline.
        let exit_code = self
            .wait_for_completion(job.id, &container_id)
            .await
            .map_err(|e| (e, Some(runner_and_container.clone())))?;

        Ok(JobOutcome { success: exit_code == 0, exit_code, runner_id: runner.id, container_id })
    }

    async fn wait_for_completion(&self, job_id: Uuid, container_id: &str) -> Result<i64> {
        let deadline = tokio::time::Instant::now() + self.job_deadline;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(OrchestratorError::Transient(format!("job {job_id} exceeded its deadline")));
                }
            }

            if let Some(exit_code) = self.lifecycle.poll_exit(container_id).await? {
                if exit_code != 0 {
                    info!(job_id = %job_id, exit_code, "container exited non-zero");
                }
                return Ok(exit_code);
            }

            if let Some(job) = self.storage.find_job(job_id).await? {
                if job.status.is_terminal() {
                    return Ok(job.exit_code.unwrap_or(0));
                }
            }
        }
    }

    async fn best_effort_teardown(&self, container_id: &str) -> Result<()> {
        self.lifecycle.stop(container_id, 10).await?;
        self.lifecycle.remove(container_id, true).await
    }
}

struct JobOutcome {
    success: bool,
    exit_code: i64,
    runner_id: Uuid,
    container_id: String,
}

/// Background sweep: five minutes after an Ephemeral runner's job
/// completes, remove its container and drop the runner row.
pub async fn run_ephemeral_cleanup(storage: Arc<StorageGateway>, lifecycle: Arc<ContainerLifecycleManager>, completed: PendingCleanup) {
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;

        let now = std::time::Instant::now();
        let due: Vec<(Uuid, String)> = {
            let map = completed.read().await;
            map.iter()
                .filter(|(_, (_, since))| now.duration_since(*since) >= CONTAINER_CLEANUP_DELAY)
                .map(|(runner_id, (container_id, _))| (*runner_id, container_id.clone()))
                .collect()
        };

        for (runner_id, container_id) in due {
            if let Err(e) = lifecycle.remove(&container_id, true).await {
                warn!(%runner_id, error = %e, "ephemeral container cleanup failed");
                continue;
            }
            if let Err(e) = storage.release_runner_container(runner_id).await {
                warn!(%runner_id, error = %e, "failed to clear container_id after cleanup");
            }
            let _ = storage.delete_runner(runner_id).await;
            completed.write().await.remove(&runner_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_outcome_success_follows_zero_exit_code() {
        let outcome = JobOutcome { success: true, exit_code: 0, runner_id: Uuid::new_v4(), container_id: "c1".into() };
        assert!(outcome.success);
        let failed = JobOutcome { success: false, exit_code: 1, runner_id: Uuid::new_v4(), container_id: "c2".into() };
        assert!(!failed.success);
    }
}
