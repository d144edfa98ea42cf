//! Monitoring Sink: subscribes to every [`SystemEvent`], keeps a registry of
//! Prometheus counters/histograms up to date, and exposes them over HTTP.

use axum::{response::IntoResponse, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use tracing::warn;

use crate::events::{ContainerEvent, DelegatedJobEvent, EventBus, JobQueueEvent, PoolEvent, SystemEvent, WebhookEvent};

static JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("orchestrator_jobs_total", "Delegated jobs by terminal outcome", &["outcome"])
        .expect("metric registers once")
});

static JOB_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "orchestrator_job_duration_seconds",
        "Wall-clock time from Running to a terminal state",
        &["outcome"]
    )
    .expect("metric registers once")
});

static WEBHOOKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("orchestrator_webhooks_total", "Inbound webhook deliveries by result", &["result"])
        .expect("metric registers once")
});

static CONTAINER_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("orchestrator_container_events_total", "Container lifecycle transitions", &["event"])
        .expect("metric registers once")
});

static POOL_SCALE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("orchestrator_pool_scale_total", "Auto-Scaler actions taken", &["direction"])
        .expect("metric registers once")
});

static QUEUE_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("orchestrator_queue_events_total", "Job Queue admission outcomes", &["event"])
        .expect("metric registers once")
});

/// Drains the event bus and updates the process-global Prometheus registry.
/// Runs for the lifetime of the process; never returns under normal
/// operation.
pub async fn run_sink(events: EventBus) {
    let mut rx = events.subscribe();

    loop {
        match rx.recv().await {
            Ok(event) => record(event),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "monitoring sink lagged behind the event bus");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn record(event: SystemEvent) {
    match event {
        SystemEvent::DelegatedJob(e) => record_job(e),
        SystemEvent::Container(e) => record_container(e),
        SystemEvent::Webhook(e) => record_webhook(e),
        SystemEvent::Pool(e) => record_pool(e),
        SystemEvent::JobQueue(e) => record_queue(e),
        SystemEvent::Leadership(_) => {}
    }
}

fn record_job(event: DelegatedJobEvent) {
    match event {
        DelegatedJobEvent::Completed { duration_ms, exit_code, .. } => {
            let outcome = if exit_code == 0 { "success" } else { "failure" };
            JOBS_TOTAL.with_label_values(&[outcome]).inc();
            JOB_DURATION_SECONDS.with_label_values(&[outcome]).observe(duration_ms as f64 / 1000.0);
        }
        DelegatedJobEvent::Failed { .. } => {
            JOBS_TOTAL.with_label_values(&["failure"]).inc();
        }
        DelegatedJobEvent::Cancelled { .. } => {
            JOBS_TOTAL.with_label_values(&["cancelled"]).inc();
        }
        DelegatedJobEvent::Queued { .. } | DelegatedJobEvent::Assigned { .. } | DelegatedJobEvent::Running { .. } => {}
    }
}

fn record_container(event: ContainerEvent) {
    let label = match event {
        ContainerEvent::Created { .. } => "created",
        ContainerEvent::Starting { .. } => "starting",
        ContainerEvent::Started { .. } => "started",
        ContainerEvent::Stopping { .. } => "stopping",
        ContainerEvent::Stopped { .. } => "stopped",
        ContainerEvent::Removing { .. } => "removing",
        ContainerEvent::Removed { .. } => "removed",
        ContainerEvent::Error { .. } => "error",
        ContainerEvent::HighCpu { .. } => "high_cpu",
        ContainerEvent::HighMemory { .. } => "high_memory",
    };
    CONTAINER_EVENTS_TOTAL.with_label_values(&[label]).inc();
}

fn record_webhook(event: WebhookEvent) {
    let label = match event {
        WebhookEvent::Received { .. } => "received",
        WebhookEvent::Deduplicated { .. } => "deduplicated",
        WebhookEvent::Processed { .. } => "processed",
        WebhookEvent::Failed { .. } => "failed",
    };
    WEBHOOKS_TOTAL.with_label_values(&[label]).inc();
}

fn record_pool(event: PoolEvent) {
    match event {
        PoolEvent::ScaledUp { .. } => POOL_SCALE_TOTAL.with_label_values(&["up"]).inc(),
        PoolEvent::ScaledDown { .. } => POOL_SCALE_TOTAL.with_label_values(&["down"]).inc(),
        PoolEvent::Maintained { .. } => {}
    }
}

fn record_queue(event: JobQueueEvent) {
    let label = match event {
        JobQueueEvent::Enqueued { .. } => "enqueued",
        JobQueueEvent::Claimed { .. } => "claimed",
        JobQueueEvent::Succeeded { .. } => "succeeded",
        JobQueueEvent::Failed { .. } => "failed",
        JobQueueEvent::DeadLettered { .. } => "dead_lettered",
    };
    QUEUE_EVENTS_TOTAL.with_label_values(&[label]).inc();
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "failed to encode prometheus metrics");
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn job_completed_with_zero_exit_records_success() {
        let before = JOBS_TOTAL.with_label_values(&["success"]).get();
        record(SystemEvent::DelegatedJob(DelegatedJobEvent::Completed {
            job_id: Uuid::new_v4(),
            exit_code: 0,
            duration_ms: 500,
        }));
        assert_eq!(JOBS_TOTAL.with_label_values(&["success"]).get(), before + 1);
    }

    #[test]
    fn job_completed_with_nonzero_exit_records_failure() {
        let before = JOBS_TOTAL.with_label_values(&["failure"]).get();
        record(SystemEvent::DelegatedJob(DelegatedJobEvent::Completed {
            job_id: Uuid::new_v4(),
            exit_code: 1,
            duration_ms: 500,
        }));
        assert_eq!(JOBS_TOTAL.with_label_values(&["failure"]).get(), before + 1);
    }

    #[test]
    fn leadership_events_are_ignored_without_panicking() {
        record(SystemEvent::Leadership(crate::events::LeadershipEvent::Acquired { node_id: "n1".into() }));
    }
}
