//! Standalone client for the upstream source-forge API (runner registration,
//! workflow run/job listing), extracted from the orchestrator crate the way
//! third-party API clients are extracted elsewhere: an options struct plus a
//! service struct wrapping a `reqwest::Client`.

pub mod cache;
pub mod client;
pub mod error;
pub mod models;
pub mod scheduler;

pub use client::{ForgeClient, ForgeOptions};
pub use error::{ForgeError, Result};
pub use models::{Priority, RateLimit, RunnerInfo, RunnerToken, WorkflowJobSummary, WorkflowRunSummary};
pub use scheduler::Strategy;
