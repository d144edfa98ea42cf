pub mod job_queue;
pub mod worker;

pub use job_queue::{ClaimedJob, JobQueue, QueuedJobStatus, GITHUB_JOBS_QUEUE};
pub use worker::{JobWorker, JobWorkerConfig};
