use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("forge request rejected: {0}")]
    Invalid(String),
    #[error("forge credentials rejected")]
    Unauthorized,
    #[error("forge resource not found: {0}")]
    NotFound(String),
    #[error("forge rate limit exhausted, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("forge upstream error: {0}")]
    Upstream(String),
    #[error("forge request timed out")]
    Timeout,
}

impl ForgeError {
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            400 | 422 => ForgeError::Invalid(body.to_string()),
            401 => ForgeError::Unauthorized,
            404 => ForgeError::NotFound(body.to_string()),
            408 | 429 | 500 | 502 | 503 | 504 => ForgeError::Upstream(body.to_string()),
            _ => ForgeError::Upstream(format!("unexpected status {status}: {body}")),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ForgeError::Upstream(_) | ForgeError::RateLimited { .. } | ForgeError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;
