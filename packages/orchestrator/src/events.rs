//! Typed event variants published across component boundaries.
//!
//! Every cross-component notification is a variant of [`SystemEvent`]
//! delivered over a broadcast channel via [`EventBus`]. Components publish;
//! they never call each other directly across the webhook → queue →
//! orchestrator → webhook cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContainerEvent {
    Created { container_id: String, job_id: Uuid },
    Starting { container_id: String },
    Started { container_id: String },
    Stopping { container_id: String },
    Stopped { container_id: String, exit_code: Option<i64> },
    Removing { container_id: String },
    Removed { container_id: String },
    Error { container_id: String, message: String },
    HighCpu { container_id: String, cpu_percent: f64 },
    HighMemory { container_id: String, memory_percent: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobQueueEvent {
    Enqueued { job_id: Uuid, queue: String, priority: i32 },
    Claimed { job_id: Uuid, worker_id: String },
    Succeeded { job_id: Uuid, duration_ms: i64 },
    Failed { job_id: Uuid, error: String, will_retry: bool },
    DeadLettered { job_id: Uuid, total_attempts: i32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DelegatedJobEvent {
    Queued { job_id: Uuid, repository: String, priority: i32 },
    Assigned { job_id: Uuid, runner_id: Uuid },
    Running { job_id: Uuid, runner_id: Uuid, started_at: DateTime<Utc> },
    Completed { job_id: Uuid, exit_code: i64, duration_ms: i64 },
    Failed { job_id: Uuid, error: String },
    Cancelled { job_id: Uuid, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PoolEvent {
    ScaledUp { repository: String, by: u32, runner_count: u32, reason: String },
    ScaledDown { repository: String, by: u32, runner_count: u32, reason: String },
    Maintained { repository: String, runner_count: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WebhookEvent {
    Received { delivery_id: String, event_type: String },
    Deduplicated { delivery_id: String },
    Processed { delivery_id: String, duration_ms: i64 },
    Failed { delivery_id: String, error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LeadershipEvent {
    Acquired { node_id: String },
    Lost { node_id: String },
}

/// The union of every event family a subscriber may see on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemEvent {
    Container(ContainerEvent),
    JobQueue(JobQueueEvent),
    DelegatedJob(DelegatedJobEvent),
    Pool(PoolEvent),
    Webhook(WebhookEvent),
    Leadership(LeadershipEvent),
}

impl From<ContainerEvent> for SystemEvent {
    fn from(e: ContainerEvent) -> Self {
        SystemEvent::Container(e)
    }
}
impl From<JobQueueEvent> for SystemEvent {
    fn from(e: JobQueueEvent) -> Self {
        SystemEvent::JobQueue(e)
    }
}
impl From<DelegatedJobEvent> for SystemEvent {
    fn from(e: DelegatedJobEvent) -> Self {
        SystemEvent::DelegatedJob(e)
    }
}
impl From<PoolEvent> for SystemEvent {
    fn from(e: PoolEvent) -> Self {
        SystemEvent::Pool(e)
    }
}
impl From<WebhookEvent> for SystemEvent {
    fn from(e: WebhookEvent) -> Self {
        SystemEvent::Webhook(e)
    }
}
impl From<LeadershipEvent> for SystemEvent {
    fn from(e: LeadershipEvent) -> Self {
        SystemEvent::Leadership(e)
    }
}

/// Publish/subscribe boundary. Components hold a clone and publish; the
/// Monitoring Sink and any other interested component subscribes.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: impl Into<SystemEvent>) {
        // A lagging or absent subscriber must never block or fail a publisher.
        let _ = self.sender.send(event.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_all_subscribers() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(WebhookEvent::Received {
            delivery_id: "d1".into(),
            event_type: "workflow_job".into(),
        });

        let ea = a.recv().await.unwrap();
        let eb = b.recv().await.unwrap();
        assert!(matches!(ea, SystemEvent::Webhook(WebhookEvent::Received { .. })));
        assert!(matches!(eb, SystemEvent::Webhook(WebhookEvent::Received { .. })));
    }

    #[test]
    fn event_round_trips_through_json() {
        let e = SystemEvent::DelegatedJob(DelegatedJobEvent::Completed {
            job_id: Uuid::new_v4(),
            exit_code: 0,
            duration_ms: 1234,
        });
        let json = serde_json::to_string(&e).unwrap();
        let back: SystemEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, SystemEvent::DelegatedJob(DelegatedJobEvent::Completed { .. })));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(PoolEvent::Maintained { repository: "o/r".into(), runner_count: 2 });
    }
}
