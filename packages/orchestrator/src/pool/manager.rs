//! Per-repository runner pools with min/max bounds and utilization
//! tracking. A `RunnerRequest` either resolves immediately to an Idle
//! runner or is left pending for the next scale-up/release to satisfy.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::common::network_name::sanitize;
use crate::error::Result;
use crate::events::{EventBus, PoolEvent};
use crate::storage::models::{Runner, RunnerStatus, RunnerType};
use crate::storage::StorageGateway;

#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics {
    pub total: u32,
    pub active: u32,
    pub utilization: f64,
}

pub enum RunnerRequest {
    Satisfied(Runner),
    Pending,
}

pub struct PoolManager {
    storage: Arc<StorageGateway>,
    events: EventBus,
}

impl PoolManager {
    pub fn new(storage: Arc<StorageGateway>, events: EventBus) -> Self {
        Self { storage, events }
    }

    pub async fn get_active_runners(&self, repository: &str) -> Result<Vec<Runner>> {
        self.storage.get_active_runners(repository).await
    }

    /// Returns an Idle runner matching every required label if one exists;
    /// otherwise the request is left pending for the Auto-Scaler's next
    /// scale-up or a future release to satisfy.
    pub async fn request_runner(&self, repository: &str, required_labels: &[String]) -> Result<RunnerRequest> {
        self.storage.get_or_create_pool(repository).await?;

        let runners = self.storage.get_active_runners(repository).await?;
        let candidate = runners.into_iter().find(|r| {
            r.status == RunnerStatus::Idle
                && required_labels.iter().all(|l| r.labels_vec().contains(l))
        });

        Ok(match candidate {
            Some(r) => RunnerRequest::Satisfied(r),
            None => RunnerRequest::Pending,
        })
    }

    pub async fn release_runner(&self, runner_id: Uuid) -> Result<()> {
        self.storage.set_runner_status(runner_id, RunnerStatus::Idle, None).await
    }

    pub async fn get_pool_metrics(&self, repository: &str) -> Result<PoolMetrics> {
        let runners = self.storage.get_active_runners(repository).await?;
        let total = runners.len() as u32;
        let active = runners.iter().filter(|r| r.status == RunnerStatus::Busy).count() as u32;
        let utilization = if total == 0 { 0.0 } else { active as f64 / total as f64 };
        Ok(PoolMetrics { total, active, utilization })
    }

    /// Adds up to `n` Proxy runners, bounded by the pool's `max_runners`.
    /// Inserted Idle so a pending `request_runner` can be satisfied
    /// immediately; Proxy runners have no managed container of their own.
    pub async fn scale_up(&self, repository: &str, n: u32, reason: &str) -> Result<()> {
        let pool = self.storage.get_or_create_pool(repository).await?;
        let metrics = self.get_pool_metrics(repository).await?;
        let room = (pool.max_runners.max(0) as u32).saturating_sub(metrics.total);
        let to_add = n.min(room);
        if to_add == 0 {
            return Ok(());
        }

        for _ in 0..to_add {
            let short_id = Uuid::new_v4().to_string()[..8].to_string();
            let runner = Runner::builder()
                .id(Uuid::new_v4())
                .name(format!("proxy-{}-{short_id}", sanitize(repository)))
                .runner_type(RunnerType::Proxy)
                .repository(repository.to_string())
                .status(RunnerStatus::Idle)
                .last_heartbeat(Utc::now())
                .updated_at(Utc::now())
                .build();
            self.storage.insert_runner(&runner).await?;
        }

        self.storage.set_pool_runner_count_marker(repository).await?;
        self.events.publish(PoolEvent::ScaledUp {
            repository: repository.to_string(),
            by: to_add,
            runner_count: metrics.total + to_add,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Removes up to `n` Idle runners, bounded by the pool's `min_runners`.
    /// Busy runners are never candidates, so the actual count removed may be
    /// less than both `n` and the min/max-derived room if too few are Idle.
    pub async fn scale_down(&self, repository: &str, n: u32, reason: &str) -> Result<()> {
        let pool = self.storage.get_or_create_pool(repository).await?;
        let runners = self.storage.get_active_runners(repository).await?;
        let total = runners.len() as u32;
        let room = total.saturating_sub(pool.min_runners.max(0) as u32);
        let idle: Vec<Uuid> = runners.iter().filter(|r| r.status == RunnerStatus::Idle).map(|r| r.id).collect();
        let to_remove = n.min(room).min(idle.len() as u32);
        if to_remove == 0 {
            return Ok(());
        }

        for runner_id in idle.into_iter().take(to_remove as usize) {
            self.storage.delete_runner(runner_id).await?;
        }

        self.storage.set_pool_runner_count_marker(repository).await?;
        self.events.publish(PoolEvent::ScaledDown {
            repository: repository.to_string(),
            by: to_remove,
            runner_count: total.saturating_sub(to_remove),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_is_zero_with_no_runners() {
        let metrics = PoolMetrics { total: 0, active: 0, utilization: 0.0 };
        assert_eq!(metrics.utilization, 0.0);
    }

    #[test]
    fn utilization_is_busy_over_total() {
        let total = 4u32;
        let active = 3u32;
        let utilization = active as f64 / total as f64;
        assert_eq!(utilization, 0.75);
    }
}
