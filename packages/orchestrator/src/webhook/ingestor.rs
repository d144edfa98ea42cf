//! Verifies, deduplicates, persists, and dispatches inbound webhook
//! deliveries. `workflow_job` is the only family whose `action` drives job
//! lifecycle transitions; the rest are acknowledged and persisted for
//! reconciliation/analytics only.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::dedup::DedupCache;
use super::github_types::WorkflowJobEvent;
use super::signature;
use crate::common::hashing::dedup_key;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, WebhookEvent};
use crate::pool::manager::PoolManager;
use crate::queue::job_queue::{JobQueue, GITHUB_JOBS_QUEUE};
use crate::storage::models::{DelegatedJob, JobStatus, RunnerStatus, WebhookEventRow};
use crate::storage::StorageGateway;

pub const SUPPORTED_EVENT_TYPES: &[&str] = &[
    "workflow_job",
    "workflow_run",
    "workflow_dispatch",
    "push",
    "pull_request",
    "create",
    "delete",
    "deployment",
    "deployment_status",
    "release",
    "repository",
    "code_scanning_alert",
    "secret_scanning_alert",
    "security_advisory",
    "ping",
];

pub struct IngestResult {
    pub success: bool,
    pub processed: bool,
    pub deduplicated: bool,
    pub message: String,
    pub processing_time_ms: Option<i64>,
}

pub struct WebhookIngestor {
    storage: Arc<StorageGateway>,
    queue: Arc<JobQueue>,
    pools: Arc<PoolManager>,
    events: EventBus,
    dedup: DedupCache,
    webhook_secret: Option<String>,
}

impl WebhookIngestor {
    pub fn new(
        storage: Arc<StorageGateway>,
        queue: Arc<JobQueue>,
        pools: Arc<PoolManager>,
        events: EventBus,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            storage,
            queue,
            pools,
            events,
            dedup: DedupCache::new(Duration::from_secs(60)),
            webhook_secret,
        }
    }

    pub fn verify_signature(&self, body: &[u8], signature_header: Option<&str>) -> bool {
        match (&self.webhook_secret, signature_header) {
            (Some(secret), Some(sig)) => signature::verify(secret, body, sig),
            (Some(_), None) => false,
            (None, _) => {
                warn!("webhook signature verification skipped: no secret configured");
                true
            }
        }
    }

    pub async fn ingest(
        &self,
        event_type: &str,
        delivery_id: &str,
        body: &[u8],
    ) -> Result<IngestResult> {
        let started = Instant::now();

        if !SUPPORTED_EVENT_TYPES.contains(&event_type) {
            info!(event_type, "unsupported event type acknowledged without processing");
            return Ok(IngestResult {
                success: true,
                processed: false,
                deduplicated: false,
                message: "unsupported".into(),
                processing_time_ms: None,
            });
        }

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| OrchestratorError::Validation(format!("invalid JSON body: {e}")))?;

        let (action, repository, workflow_job_id, workflow_run_id, pull_request_id, issue_id) =
            extract_dedup_fields(event_type, &payload);

        let key = dedup_key(
            event_type,
            delivery_id,
            action.as_deref(),
            &repository,
            workflow_job_id,
            workflow_run_id,
            pull_request_id,
            issue_id,
        );

        if self.dedup.check_and_record(&key).await {
            self.events.publish(WebhookEvent::Deduplicated { delivery_id: delivery_id.to_string() });
            return Ok(IngestResult {
                success: true,
                processed: false,
                deduplicated: true,
                message: "deduplicated".into(),
                processing_time_ms: None,
            });
        }

        self.events.publish(WebhookEvent::Received {
            delivery_id: delivery_id.to_string(),
            event_type: event_type.to_string(),
        });

        let row = WebhookEventRow {
            id: delivery_id.to_string(),
            repository: repository.clone(),
            event: event_type.to_string(),
            action: action.clone(),
            payload: payload.clone(),
            signature: None,
            timestamp: Utc::now(),
            processed: false,
            processing_attempts: 0,
            last_processing_error: None,
            processing_duration_ms: None,
            dedup_key: key,
        };

        // The insert is the linearization point for dedup: it must exist
        // before any handler runs.
        self.storage.insert_webhook_event(&row).await?;

        let handler_result = self.dispatch(event_type, &payload).await;

        let elapsed_ms = started.elapsed().as_millis() as i64;

        match handler_result {
            Ok(()) => {
                self.storage
                    .mark_webhook_outcome(delivery_id, true, None, elapsed_ms)
                    .await?;
                self.events.publish(WebhookEvent::Processed {
                    delivery_id: delivery_id.to_string(),
                    duration_ms: elapsed_ms,
                });
                Ok(IngestResult {
                    success: true,
                    processed: true,
                    deduplicated: false,
                    message: "processed".into(),
                    processing_time_ms: Some(elapsed_ms),
                })
            }
            Err(e) => {
                self.storage
                    .mark_webhook_outcome(delivery_id, false, Some(&e.to_string()), elapsed_ms)
                    .await?;
                self.events.publish(WebhookEvent::Failed {
                    delivery_id: delivery_id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Re-runs the handler for an already-persisted delivery using the
    /// stored payload. Side effects are identical to the original
    /// `ingest` call modulo `processing_attempts`/timestamps.
    pub async fn replay(&self, delivery_id: &str) -> Result<IngestResult> {
        let started = Instant::now();
        let row = self
            .storage
            .get_webhook_event(delivery_id)
            .await?
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown delivery_id {delivery_id}")))?;

        let result = self.dispatch(&row.event, &row.payload).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                self.storage.mark_webhook_outcome(delivery_id, true, None, elapsed_ms).await?;
                Ok(IngestResult {
                    success: true,
                    processed: true,
                    deduplicated: false,
                    message: "replayed".into(),
                    processing_time_ms: Some(elapsed_ms),
                })
            }
            Err(e) => {
                self.storage
                    .mark_webhook_outcome(delivery_id, false, Some(&e.to_string()), elapsed_ms)
                    .await?;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event_type: &str, payload: &Value) -> Result<()> {
        match event_type {
            "workflow_job" => {
                let event: WorkflowJobEvent = serde_json::from_value(payload.clone())
                    .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
                self.handle_workflow_job(event).await
            }
            "ping" => Ok(()),
            _ => {
                // Persisted above for reconciliation; no further handler logic.
                Ok(())
            }
        }
    }

    async fn handle_workflow_job(&self, event: WorkflowJobEvent) -> Result<()> {
        let repository = event.repository.full_name.clone();

        match event.action.as_str() {
            "queued" => {
                let priority = compute_priority(&event.workflow_job.labels, event.repository.private);

                let existing = self
                    .storage
                    .find_job_by_forge_ids(event.workflow_job.id, event.workflow_job.run_id)
                    .await?;

                if existing.is_some() {
                    return Ok(());
                }

                let job = DelegatedJob::builder()
                    .id(uuid::Uuid::new_v4())
                    .job_id(event.workflow_job.id)
                    .run_id(event.workflow_job.run_id)
                    .repository(repository.clone())
                    .workflow_name(event.workflow_job.workflow_name.clone().unwrap_or_else(|| event.workflow_job.name.clone()))
                    .labels(serde_json::json!(event.workflow_job.labels))
                    .head_sha(event.workflow_job.head_sha.clone())
                    .created_at(Utc::now())
                    .priority(priority)
                    .build();

                self.storage.insert_job(&job).await?;
                self.queue
                    .add(GITHUB_JOBS_QUEUE, serde_json::json!({ "job_id": job.id }), priority)
                    .await?;
                self.pools.request_runner(&repository, &event.workflow_job.labels).await?;

                info!(job_id = %job.id, priority, "delegated job queued");
            }
            "in_progress" => {
                let job = self
                    .storage
                    .find_job_by_forge_ids(event.workflow_job.id, event.workflow_job.run_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::Conflict("workflow_job not found for in_progress".into()))?;

                // A job dispatched straight from `queued` is still Pending:
                // nothing in this webhook-driven path runs the Orchestrator's
                // own Assigned step, so pass through it here before Running.
                let status = if job.status == JobStatus::Pending {
                    self.storage.transition_job_status(job.id, JobStatus::Assigned, None).await?;
                    JobStatus::Assigned
                } else {
                    job.status
                };

                if !status.can_transition_to(JobStatus::Running) {
                    warn!(job_id = %job.id, ?status, "ignoring in_progress for job not assignable to Running");
                    return Ok(());
                }

                // The forge's numeric runner_id has no relationship to ours;
                // `runner_name` is the identifier we control, since it's the
                // name we register self-hosted runners under.
                let runner = match &event.workflow_job.runner_name {
                    Some(name) => self.storage.find_runner_by_name(name).await?,
                    None => None,
                };

                self.storage
                    .transition_job_status(job.id, JobStatus::Running, runner.as_ref().map(|r| r.id))
                    .await?;

                if let Some(runner) = runner {
                    self.storage.set_runner_status(runner.id, RunnerStatus::Busy, Some(job.id)).await?;
                }
            }
            "completed" => {
                let job = self
                    .storage
                    .find_job_by_forge_ids(event.workflow_job.id, event.workflow_job.run_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::Conflict("workflow_job not found for completed".into()))?;

                let success = event.workflow_job.conclusion.as_deref() == Some("success");
                let next = if success { JobStatus::Completed } else { JobStatus::Failed };

                if job.validate_transition(next) {
                    self.storage.transition_job_status(job.id, next, None).await?;
                }

                self.storage.bump_repository_stats(&repository, success).await?;

                // Always release a locally tracked Runner if `runner_id` is set,
                // regardless of whether it matches a runner known to this pool.
                if let Some(runner_id) = job.runner_id {
                    self.pools.release_runner(runner_id).await?;
                }
            }
            other => {
                info!(action = other, "workflow_job action not acted on");
            }
        }

        Ok(())
    }
}

/// `+100` production, `+75` staging, `+50` critical/urgent, `+20` ci/cd,
/// `+10` small runner, `-10` large runner, `+5` private repository.
pub fn compute_priority(labels: &[String], is_private: bool) -> i32 {
    let has = |candidates: &[&str]| labels.iter().any(|l| candidates.contains(&l.as_str()));

    let mut score = 0;
    if has(&["production", "prod", "deploy-prod"]) {
        score += 100;
    }
    if has(&["staging", "stage", "deploy-staging"]) {
        score += 75;
    }
    if has(&["critical", "urgent", "hotfix"]) {
        score += 50;
    }
    if has(&["ci", "cd", "build", "test"]) {
        score += 20;
    }
    if has(&["small-runner", "self-hosted-small", "ubuntu-latest", "macos-latest", "windows-latest"]) {
        score += 10;
    }
    if has(&["large-runner", "self-hosted-large", "4-core", "8-core", "16-core", "32-core"]) {
        score -= 10;
    }
    if is_private {
        score += 5;
    }
    score
}

fn extract_dedup_fields(
    event_type: &str,
    payload: &Value,
) -> (Option<String>, String, Option<i64>, Option<i64>, Option<i64>, Option<i64>) {
    let action = payload.get("action").and_then(|v| v.as_str()).map(str::to_string);
    let repository = payload
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let workflow_job_id = payload
        .get("workflow_job")
        .and_then(|j| j.get("id"))
        .and_then(|v| v.as_i64());
    let workflow_run_id_from_job = payload
        .get("workflow_job")
        .and_then(|j| j.get("run_id"))
        .and_then(|v| v.as_i64());
    let workflow_run_id_from_run = payload
        .get("workflow_run")
        .and_then(|j| j.get("id"))
        .and_then(|v| v.as_i64());
    let pull_request_id = payload
        .get("pull_request")
        .and_then(|j| j.get("id"))
        .and_then(|v| v.as_i64());
    let issue_id = payload.get("issue").and_then(|j| j.get("id")).and_then(|v| v.as_i64());

    let _ = event_type;

    (
        action,
        repository,
        workflow_job_id,
        workflow_run_id_from_job.or(workflow_run_id_from_run),
        pull_request_id,
        issue_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_label_outranks_everything_else() {
        let score = compute_priority(&["production".into(), "ci".into()], false);
        assert_eq!(score, 120);
    }

    #[test]
    fn ci_and_small_runner_and_private_sum_to_thirty_five() {
        let score = compute_priority(&["ci".into(), "small-runner".into()], true);
        assert_eq!(score, 35);
    }

    #[test]
    fn happy_path_example_matches_scenario_one() {
        let score = compute_priority(&["ubuntu-latest".into(), "ci".into()], false);
        assert_eq!(score, 30);
    }

    #[test]
    fn large_runner_label_is_penalized() {
        let score = compute_priority(&["large-runner".into()], false);
        assert_eq!(score, -10);
    }
}
