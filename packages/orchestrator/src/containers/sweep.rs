//! Background tasks owned by the Container Lifecycle Manager: a stats
//! poll, a stopped-container sweep, and startup reconciliation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::lifecycle::ContainerLifecycleManager;
use crate::events::{ContainerEvent, EventBus};
use crate::storage::models::ContainerState;

pub const STATS_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const STOPPED_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const STOPPED_GRACE_PERIOD: Duration = Duration::from_secs(60 * 60);

const HIGH_CPU_THRESHOLD: f64 = 80.0;
const HIGH_MEMORY_THRESHOLD: f64 = 90.0;

/// Lists managed containers fresh on every tick rather than a fixed
/// snapshot, so a container created after this loop starts is still polled.
pub async fn run_stats_poll(manager: Arc<ContainerLifecycleManager>, events: EventBus) {
    loop {
        let running = match manager.list_managed().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "stats poll failed to list managed containers");
                tokio::time::sleep(STATS_POLL_INTERVAL).await;
                continue;
            }
        };

        for container_id in &running {
            if manager.state_of(container_id).await != Some(ContainerState::Running) {
                continue;
            }

            match manager.stats(container_id).await {
                Ok(usage) => {
                    if usage.cpu_percent > HIGH_CPU_THRESHOLD {
                        events.publish(ContainerEvent::HighCpu {
                            container_id: container_id.clone(),
                            cpu_percent: usage.cpu_percent,
                        });
                    }
                    if usage.memory_percent > HIGH_MEMORY_THRESHOLD {
                        events.publish(ContainerEvent::HighMemory {
                            container_id: container_id.clone(),
                            memory_percent: usage.memory_percent,
                        });
                    }
                }
                Err(e) => warn!(container_id, error = %e, "stats poll failed"),
            }
        }

        tokio::time::sleep(STATS_POLL_INTERVAL).await;
    }
}

/// Removes containers that have been Stopped for longer than the grace
/// period.
pub async fn run_stopped_sweep(
    manager: Arc<ContainerLifecycleManager>,
    stopped_since: Arc<tokio::sync::RwLock<std::collections::HashMap<String, std::time::Instant>>>,
) {
    loop {
        tokio::time::sleep(STOPPED_SWEEP_INTERVAL).await;

        let now = std::time::Instant::now();
        let due: Vec<String> = {
            let map = stopped_since.read().await;
            map.iter()
                .filter(|(_, since)| now.duration_since(**since) >= STOPPED_GRACE_PERIOD)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for container_id in due {
            if let Err(e) = manager.remove(&container_id, false).await {
                warn!(container_id, error = %e, "stopped-container sweep failed to remove container");
                continue;
            }
            stopped_since.write().await.remove(&container_id);
        }
    }
}

/// Re-ingests existing containers tagged `managed=true` at startup so a
/// restart doesn't orphan containers created by a previous process.
pub async fn reconcile_on_startup(manager: &ContainerLifecycleManager) -> anyhow::Result<Vec<String>> {
    let managed = manager.list_managed().await?;
    info!(count = managed.len(), "reconciled managed containers on startup");
    Ok(managed)
}
