use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimit {
    pub remaining: u32,
    pub limit: u32,
    pub used: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimit {
    pub fn fresh(limit: u32) -> Self {
        Self { remaining: limit, limit, used: 0, reset_at: Utc::now() }
    }

    pub fn fraction_remaining(&self) -> f64 {
        if self.limit == 0 {
            1.0
        } else {
            self.remaining as f64 / self.limit as f64
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerInfo {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunSummary {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub head_branch: String,
    pub head_sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJobSummary {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub labels: Vec<String>,
}
