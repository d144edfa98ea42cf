//! Data model: Delegated Job, Runner, Runner Pool, Container, Routing Rule,
//! Webhook Event, Workflow Run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether `self -> next` is a legal forward transition in the DAG
    /// Pending -> Assigned -> Running -> {Completed, Failed, Cancelled}.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Assigned, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, FromRow, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(setter(into)))]
pub struct DelegatedJob {
    pub id: Uuid,
    pub job_id: i64,
    pub run_id: i64,
    pub repository: String,
    pub workflow_name: String,
    #[builder(default)]
    pub labels: Value,
    pub head_sha: String,
    #[builder(default = JobStatus::Pending)]
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub runner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub exit_code: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
    #[builder(default = 0)]
    pub priority: i32,
}

impl DelegatedJob {
    pub fn labels_vec(&self) -> Vec<String> {
        self.labels
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    /// Reject a transition that would move the job backward; a caller
    /// observing this returns `OrchestratorError::Conflict`.
    pub fn validate_transition(&self, next: JobStatus) -> bool {
        self.status.can_transition_to(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RunnerType {
    Proxy,
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RunnerStatus {
    Starting,
    Idle,
    Busy,
    Offline,
}

#[derive(Debug, Clone, FromRow, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(setter(into)))]
pub struct Runner {
    pub id: Uuid,
    pub name: String,
    #[builder(default = RunnerType::Ephemeral)]
    pub runner_type: RunnerType,
    pub repository: String,
    #[builder(default)]
    pub labels: Value,
    #[builder(default = RunnerStatus::Starting)]
    pub status: RunnerStatus,
    #[builder(default, setter(strip_option))]
    pub container_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub current_job_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Runner {
    pub fn labels_vec(&self) -> Vec<String> {
        self.labels
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RunnerPool {
    pub repository: String,
    pub min_runners: i32,
    pub max_runners: i32,
    pub scale_increment: i32,
    pub scale_threshold: f64,
    pub last_scaled_at: Option<DateTime<Utc>>,
}

impl RunnerPool {
    pub fn new_default(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            min_runners: 1,
            max_runners: 10,
            scale_increment: 5,
            scale_threshold: 0.8,
            last_scaled_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Removing,
    Removed,
    Error,
}

impl ContainerState {
    pub fn can_transition_to(self, next: ContainerState) -> bool {
        use ContainerState::*;
        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Creating, Created)
                | (Created, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Removing)
                | (Removing, Removed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConditions {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTargets {
    #[serde(default)]
    pub runner_labels: Vec<String>,
    #[serde(default)]
    pub pool_override: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RoutingRuleRow {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub conditions: Value,
    pub targets: Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub conditions: RoutingConditions,
    pub targets: RoutingTargets,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RoutingRuleRow> for RoutingRule {
    type Error = serde_json::Error;

    fn try_from(row: RoutingRuleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            priority: row.priority,
            conditions: serde_json::from_value(row.conditions)?,
            targets: serde_json::from_value(row.targets)?,
            enabled: row.enabled,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub id: Uuid,
    pub job_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub target_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookEventRow {
    pub id: String,
    pub repository: String,
    pub event: String,
    pub action: Option<String>,
    pub payload: Value,
    pub signature: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub processed: bool,
    pub processing_attempts: i32,
    pub last_processing_error: Option<String>,
    pub processing_duration_ms: Option<i64>,
    pub dedup_key: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: i64,
    pub repository: String,
    pub workflow_name: String,
    pub head_branch: String,
    pub head_sha: String,
    pub event: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub repository: String,
    pub total_jobs: i64,
    pub successful_jobs: i64,
    pub failed_jobs: i64,
    pub last_job_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_dag_forbids_backward_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Assigned));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Completed.is_terminal());
    }

    #[test]
    fn container_state_allows_error_from_anywhere() {
        assert!(ContainerState::Creating.can_transition_to(ContainerState::Error));
        assert!(ContainerState::Running.can_transition_to(ContainerState::Error));
        assert!(!ContainerState::Creating.can_transition_to(ContainerState::Running));
    }
}
