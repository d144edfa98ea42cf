//! Error taxonomy for the control plane.
//!
//! Kinds mirror the failure modes a caller actually needs to branch on:
//! malformed input, upstream forge failures, daemon failures, policy
//! blocks, monotonicity conflicts, and transient store/broker hiccups.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("upstream forge error: {0}")]
    Upstream(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("container daemon error: {0}")]
    Daemon(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient error: {0}")]
    Transient(String),
}

impl From<forge_client::ForgeError> for OrchestratorError {
    fn from(e: forge_client::ForgeError) -> Self {
        match e {
            forge_client::ForgeError::RateLimited { retry_after_secs } => {
                OrchestratorError::RateLimited { retry_after_secs }
            }
            forge_client::ForgeError::Unauthorized | forge_client::ForgeError::Invalid(_) => {
                OrchestratorError::Validation(e.to_string())
            }
            other => OrchestratorError::Upstream(other.to_string()),
        }
    }
}

impl OrchestratorError {
    /// Whether retrying the operation that produced this error, unchanged, is
    /// expected to help. Validation/PolicyViolation/Conflict never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Upstream(_)
                | OrchestratorError::RateLimited { .. }
                | OrchestratorError::Transient(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
