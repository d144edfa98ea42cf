//! Composition root. Wires every component's concrete type together once,
//! at startup, and exposes the handles `bin/orchestrator.rs` needs to spawn
//! background loops and mount HTTP routers.

use bollard::Docker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::autoscaler::AutoScaler;
use crate::config::Config;
use crate::containers::sweep;
use crate::containers::ContainerLifecycleManager;
use crate::error::Result;
use crate::events::EventBus;
use crate::lock::DistributedLock;
use crate::network::NetworkIsolation;
use crate::orchestrator::{run_ephemeral_cleanup, Orchestrator};
use crate::pool::PoolManager;
use crate::queue::{JobQueue, JobWorker, JobWorkerConfig, GITHUB_JOBS_QUEUE};
use crate::router::JobRouter;
use crate::storage::StorageGateway;
use crate::webhook::WebhookIngestor;
use forge_client::{ForgeClient, ForgeOptions};

pub struct System {
    pub config: Config,
    pub storage: Arc<StorageGateway>,
    pub events: EventBus,
    pub queue: Arc<JobQueue>,
    pub pools: Arc<PoolManager>,
    pub router: Arc<JobRouter>,
    pub lifecycle: Arc<ContainerLifecycleManager>,
    pub network: Arc<NetworkIsolation>,
    pub forge: Arc<ForgeClient>,
    pub ingestor: Arc<WebhookIngestor>,
    pub orchestrator: Arc<Orchestrator>,
    pub autoscaler: Arc<AutoScaler>,
}

impl System {
    pub async fn new(config: Config) -> Result<Self> {
        let storage = Arc::new(
            StorageGateway::connect(
                &config.database_url,
                config.database_replica_url.as_deref(),
                &config.redis_url,
            )
            .await
            .map_err(|e| crate::error::OrchestratorError::Transient(e.to_string()))?,
        );

        let events = EventBus::default();

        let queue = Arc::new(JobQueue::new(storage.write_pool().clone()));
        let pools = Arc::new(PoolManager::new(storage.clone(), events.clone()));
        let router = Arc::new(JobRouter::new(storage.clone()).await?);

        let docker = Docker::connect_with_socket(&config.docker_socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| crate::error::OrchestratorError::Daemon(e.to_string()))?;
        let network = Arc::new(NetworkIsolation::new(docker));
        let lifecycle = Arc::new(
            ContainerLifecycleManager::connect(&config.docker_socket, events.clone(), config.limits.clone())
                .map_err(|e| crate::error::OrchestratorError::Daemon(e.to_string()))?,
        );
        if let Err(e) = sweep::reconcile_on_startup(&lifecycle).await {
            warn!(error = %e, "startup container reconciliation failed");
        }

        let forge_strategy = match config.forge_strategy {
            crate::config::ForgeStrategy::Conservative => forge_client::Strategy::Conservative,
            crate::config::ForgeStrategy::Aggressive => forge_client::Strategy::Aggressive,
            crate::config::ForgeStrategy::Adaptive => forge_client::Strategy::Adaptive,
        };
        let forge_options = ForgeOptions {
            base_url: config.forge_base_url.clone(),
            token: config.forge_token.clone(),
            organization: config.organization.clone(),
            rate_limit_key: "forge:rate_limit".to_string(),
            strategy: forge_strategy,
        };
        let forge = Arc::new(ForgeClient::new(forge_options, storage.kv()));

        let ingestor = Arc::new(WebhookIngestor::new(
            storage.clone(),
            queue.clone(),
            pools.clone(),
            events.clone(),
            config.webhook_secret.clone(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            storage.clone(),
            router.clone(),
            lifecycle.clone(),
            network.clone(),
            forge.clone(),
            events.clone(),
            config.runner_image.clone(),
        ));

        let autoscaler = Arc::new(AutoScaler::new(storage.clone(), pools.clone(), config.scaler.clone()));

        Ok(Self {
            config,
            storage,
            events,
            queue,
            pools,
            router,
            lifecycle,
            network,
            forge,
            ingestor,
            orchestrator,
            autoscaler,
        })
    }

    /// Spawns the Job Worker loop, background maintenance tasks, and (if HA
    /// is enabled) the leader-only tasks behind the distributed lock.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let worker_system = self.clone();
        handles.push(tokio::spawn(async move {
            let worker = JobWorker::new(worker_system.queue.clone(), worker_system.events.clone(), JobWorkerConfig::default());
            let outcome = worker
                .run(|claimed| {
                    let system = worker_system.clone();
                    async move { system.execute_claimed(claimed).await }
                })
                .await;
            if let Err(e) = outcome {
                warn!(error = %e, "job worker loop exited");
            }
        }));

        if self.config.ha.enabled {
            let ha_system = self.clone();
            handles.push(tokio::spawn(async move { ha_system.run_leader_loop().await }));
        } else {
            let scale_system = self.clone();
            handles.push(tokio::spawn(async move { scale_system.run_autoscaler_loop().await }));
        }

        let storage = self.storage.clone();
        let lifecycle = self.lifecycle.clone();
        let pending_cleanup = self.orchestrator.pending_cleanup();
        handles.push(tokio::spawn(async move { run_ephemeral_cleanup(storage, lifecycle, pending_cleanup).await }));

        let router = self.router.clone();
        handles.push(tokio::spawn(async move { router.run_refresh_loop().await }));

        let queue_for_prune = self.queue.clone();
        handles.push(tokio::spawn(async move { queue_for_prune.run_prune_loop(GITHUB_JOBS_QUEUE).await }));

        let lifecycle_for_stats = self.lifecycle.clone();
        let events_for_stats = self.events.clone();
        handles.push(tokio::spawn(async move { sweep::run_stats_poll(lifecycle_for_stats, events_for_stats).await }));

        let lifecycle_for_stopped = self.lifecycle.clone();
        let stopped_since = self.lifecycle.stopped_since();
        handles.push(tokio::spawn(async move { sweep::run_stopped_sweep(lifecycle_for_stopped, stopped_since).await }));

        handles
    }

    async fn execute_claimed(&self, claimed: crate::queue::ClaimedJob) -> anyhow::Result<()> {
        let job_id: uuid::Uuid = claimed
            .payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("queued job {} missing job_id in payload", claimed.id))?;

        let job = self
            .storage
            .find_job(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("delegated job {job_id} not found"))?;

        self.orchestrator.execute_job(job).await?;
        Ok(())
    }

    async fn run_autoscaler_loop(&self) {
        let repositories = self.known_repositories().await;
        self.autoscaler.clone().run_tick_loop(repositories).await;
    }

    /// Only the distributed-lock holder runs the Auto-Scaler and cleanup
    /// sweepers, so a standby node never fights the active one for the same
    /// runner pool.
    async fn run_leader_loop(&self) {
        let mut lock = DistributedLock::new(
            self.storage.kv(),
            self.config.ha.lock_key.clone(),
            self.config.ha.node_id.clone(),
            self.config.ha.lock_ttl,
        );
        let renew_interval = self.config.ha.lock_ttl / 3;

        loop {
            match lock.try_acquire().await {
                Ok(true) => {
                    info!(node_id = %self.config.ha.node_id, "acquired leader lock");
                    let repositories = self.known_repositories().await;
                    let scaler = self.autoscaler.clone();
                    let tick_handle = tokio::spawn(async move { scaler.run_tick_loop(repositories).await });

                    loop {
                        tokio::time::sleep(renew_interval).await;
                        match lock.renew().await {
                            Ok(true) => continue,
                            _ => {
                                warn!("lost leader lock, stopping leader-only tasks");
                                tick_handle.abort();
                                break;
                            }
                        }
                    }
                }
                Ok(false) => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(e) => {
                    warn!(error = %e, "leader lock acquisition failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn known_repositories(&self) -> Vec<String> {
        self.storage.distinct_pool_repositories().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to load repositories for auto-scaler tick loop");
            Vec::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forge_strategy_maps_to_every_client_strategy() {
        let pairs = [
            (crate::config::ForgeStrategy::Conservative, forge_client::Strategy::Conservative),
            (crate::config::ForgeStrategy::Aggressive, forge_client::Strategy::Aggressive),
            (crate::config::ForgeStrategy::Adaptive, forge_client::Strategy::Adaptive),
        ];
        for (config_strategy, expected) in pairs {
            let mapped = match config_strategy {
                crate::config::ForgeStrategy::Conservative => forge_client::Strategy::Conservative,
                crate::config::ForgeStrategy::Aggressive => forge_client::Strategy::Aggressive,
                crate::config::ForgeStrategy::Adaptive => forge_client::Strategy::Adaptive,
            };
            assert_eq!(mapped, expected);
        }
    }
}
