//! Polls the Job Queue and dispatches claimed entries to an executor
//! function. Shutdown is a plain `Arc<AtomicBool>` flag rather than a
//! cancellation token, since each tick is short and re-checking the flag
//! between ticks is simpler than threading a token through the executor.

use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::job_queue::{ClaimedJob, JobQueue, GITHUB_JOBS_QUEUE};
use crate::error::Result;
use crate::events::{EventBus, JobQueueEvent};

pub struct JobWorkerConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub worker_id: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }
}

pub struct JobWorker {
    queue: Arc<JobQueue>,
    events: EventBus,
    config: JobWorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl JobWorker {
    pub fn new(queue: Arc<JobQueue>, events: EventBus, config: JobWorkerConfig) -> Self {
        Self { queue, events, config, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Runs until shutdown is requested, invoking `execute` for every
    /// claimed job and marking it succeeded/failed based on the outcome.
    pub async fn run<F, Fut>(&self, execute: F) -> Result<()>
    where
        F: Fn(ClaimedJob) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        loop {
            if self.is_shutdown_requested() {
                return Ok(());
            }

            let claimed = self
                .queue
                .claim(GITHUB_JOBS_QUEUE, &self.config.worker_id, self.config.batch_size)
                .await?;

            if claimed.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            for job in claimed {
                self.events.publish(JobQueueEvent::Claimed {
                    job_id: job.id,
                    worker_id: self.config.worker_id.clone(),
                });

                match execute(job.clone()).await {
                    Ok(()) => {
                        self.queue.mark_succeeded(job.id).await?;
                        self.events.publish(JobQueueEvent::Succeeded { job_id: job.id, duration_ms: 0 });
                    }
                    Err(e) => {
                        let will_retry = self.queue.mark_failed(job.id, &e.to_string()).await?;
                        self.events.publish(JobQueueEvent::Failed {
                            job_id: job.id,
                            error: e.to_string(),
                            will_retry,
                        });
                        if !will_retry {
                            self.events.publish(JobQueueEvent::DeadLettered {
                                job_id: job.id,
                                total_attempts: job.attempt + 1,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Background retention sweep; runs independently of `run`.
    pub async fn run_pruner(&self, interval: Duration) {
        loop {
            if self.is_shutdown_requested() {
                return;
            }
            let _ = self
                .queue
                .prune(
                    GITHUB_JOBS_QUEUE,
                    ChronoDuration::hours(1),
                    100,
                    ChronoDuration::hours(24),
                )
                .await;
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_handle_shares_flag_with_worker() {
        let shutdown = Arc::new(AtomicBool::new(false));
        assert!(!shutdown.load(Ordering::SeqCst));
        shutdown.store(true, Ordering::SeqCst);
        assert!(shutdown.load(Ordering::SeqCst));
    }
}
