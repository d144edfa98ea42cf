//! Creation, start, stop, exec, stats, and removal of execution containers,
//! with a state machine tracked per container.

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerStateStatusEnum;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::security::{apply_security_defaults, MANAGED_LABEL};
use crate::config::ResourceLimits;
use crate::error::{OrchestratorError, Result};
use crate::events::{ContainerEvent, EventBus};
use crate::storage::models::ContainerState;

#[derive(Debug, Clone)]
pub struct ContainerCreateSpec {
    pub image: String,
    pub env: Vec<String>,
    pub network: Option<String>,
    pub network_alias: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub output: String,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage_bytes: u64,
}

pub struct ContainerLifecycleManager {
    docker: Docker,
    events: EventBus,
    limits: ResourceLimits,
    states: RwLock<HashMap<String, ContainerState>>,
    /// When each container entered `Stopped`, for [`sweep::run_stopped_sweep`]
    /// to age off. Shared (not owned) by the sweep task, so it is its own
    /// `Arc` rather than folded into `states`.
    stopped_since: Arc<RwLock<HashMap<String, Instant>>>,
}

impl ContainerLifecycleManager {
    pub fn connect(socket_path: &str, events: EventBus, limits: ResourceLimits) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self {
            docker,
            events,
            limits,
            states: RwLock::new(HashMap::new()),
            stopped_since: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Shared handle the composition root passes to
    /// [`super::sweep::run_stopped_sweep`].
    pub fn stopped_since(&self) -> Arc<RwLock<HashMap<String, Instant>>> {
        self.stopped_since.clone()
    }

    async fn transition(&self, container_id: &str, next: ContainerState) -> Result<()> {
        let mut states = self.states.write().await;
        let current = states.get(container_id).copied().unwrap_or(ContainerState::Creating);

        if !current.can_transition_to(next) {
            return Err(OrchestratorError::Conflict(format!(
                "container {container_id} cannot move from {current:?} to {next:?}"
            )));
        }

        states.insert(container_id.to_string(), next);
        Ok(())
    }

    pub async fn create_container(
        &self,
        runner_id: Uuid,
        job_id: Uuid,
        spec: ContainerCreateSpec,
    ) -> Result<String> {
        let name = format!("runner-{runner_id}");
        let config = apply_security_defaults(
            Config {
                image: Some(spec.image.as_str()),
                env: Some(spec.env.iter().map(String::as_str).collect()),
                ..Default::default()
            },
            &self.limits,
        );

        let response = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.as_str(), platform: None }), config)
            .await
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;

        self.states.write().await.insert(response.id.clone(), ContainerState::Created);
        self.events.publish(ContainerEvent::Created { container_id: response.id.clone(), job_id });

        if let Some(network) = &spec.network {
            self.attach_network(&response.id, network, spec.network_alias.as_deref()).await?;
        }

        Ok(response.id)
    }

    async fn attach_network(&self, container_id: &str, network: &str, alias: Option<&str>) -> Result<()> {
        use bollard::network::ConnectNetworkOptions;

        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container_id,
                    endpoint_config: bollard::models::EndpointSettings {
                        aliases: alias.map(|a| vec![a.to_string()]),
                        ..Default::default()
                    },
                },
            )
            .await
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;
        Ok(())
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.transition(container_id, ContainerState::Starting).await?;
        self.events.publish(ContainerEvent::Starting { container_id: container_id.to_string() });

        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;

        self.transition(container_id, ContainerState::Running).await?;
        self.events.publish(ContainerEvent::Started { container_id: container_id.to_string() });
        Ok(())
    }

    /// Idempotent: a stop on an already-stopped container is a no-op.
    pub async fn stop(&self, container_id: &str, timeout_s: i64) -> Result<()> {
        let already_stopped = {
            let states = self.states.read().await;
            matches!(
                states.get(container_id),
                Some(ContainerState::Stopped) | Some(ContainerState::Removed) | None
            )
        };
        if already_stopped {
            return Ok(());
        }

        self.transition(container_id, ContainerState::Stopping).await?;
        self.events.publish(ContainerEvent::Stopping { container_id: container_id.to_string() });

        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: timeout_s as i64 }))
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {}
            Err(e) => return Err(OrchestratorError::Daemon(e.to_string())),
        }

        let exit_code = self.inspect_exit_code(container_id).await.ok().flatten();
        self.transition(container_id, ContainerState::Stopped).await?;
        self.stopped_since.write().await.entry(container_id.to_string()).or_insert_with(Instant::now);
        self.events.publish(ContainerEvent::Stopped { container_id: container_id.to_string(), exit_code });
        Ok(())
    }

    async fn inspect_exit_code(&self, container_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;

        Ok(inspect.state.and_then(|s| s.exit_code))
    }

    /// Idempotent: removal of a missing container is a no-op.
    pub async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        self.events.publish(ContainerEvent::Removing { container_id: container_id.to_string() });

        match self
            .docker
            .remove_container(container_id, Some(RemoveContainerOptions { force, v: true, ..Default::default() }))
            .await
        {
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(e) => return Err(OrchestratorError::Daemon(e.to_string())),
        }

        self.states.write().await.insert(container_id.to_string(), ContainerState::Removed);
        self.stopped_since.write().await.remove(container_id);
        self.events.publish(ContainerEvent::Removed { container_id: container_id.to_string() });
        Ok(())
    }

    pub async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<ExecOutcome> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;

        let mut output = String::new();
        if let StartExecResults::Attached { mut output: stream, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?
        {
            while let Some(Ok(chunk)) = stream.next().await {
                output.push_str(&chunk.to_string());
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;

        Ok(ExecOutcome { exit_code: inspect.exit_code.unwrap_or(-1), output })
    }

    pub async fn stats(&self, container_id: &str) -> Result<ResourceUsage> {
        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptions { stream: false, one_shot: true }),
        );

        let stats = stream
            .next()
            .await
            .ok_or_else(|| OrchestratorError::Daemon("no stats returned".into()))?
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let cpu_percent = if system_delta > 0.0 {
            (cpu_delta / system_delta) * stats.cpu_stats.online_cpus.unwrap_or(1) as f64 * 100.0
        } else {
            0.0
        };

        let memory_usage = stats.memory_stats.usage.unwrap_or(0);
        let memory_limit = stats.memory_stats.limit.unwrap_or(1).max(1);
        let memory_percent = memory_usage as f64 / memory_limit as f64 * 100.0;

        Ok(ResourceUsage { cpu_percent, memory_percent, memory_usage_bytes: memory_usage })
    }

    pub async fn logs(&self, container_id: &str, tail: &str) -> Result<String> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut out = String::new();
        while let Some(Ok(chunk)) = stream.next().await {
            out.push_str(&chunk.to_string());
        }
        Ok(out)
    }

    pub async fn list_managed(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions { all: true, filters, ..Default::default() }))
            .await
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    pub async fn state_of(&self, container_id: &str) -> Option<ContainerState> {
        self.states.read().await.get(container_id).copied()
    }

    /// Asks the daemon directly for this container's real status and exit
    /// code. The tracked `states` map only moves forward through the
    /// transitions this manager itself drives (create/start/stop/remove),
    /// so a container whose process exits on its own is invisible to
    /// `state_of` until something reconciles it here. Returns the real exit
    /// code once the daemon reports the container Stopped or Error.
    pub async fn poll_exit(&self, container_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;

        let Some(state) = inspect.state else { return Ok(None) };
        let Some(status) = state.status else { return Ok(None) };
        let actual = Self::to_lifecycle_state(status);
        if !matches!(actual, ContainerState::Stopped | ContainerState::Error) {
            return Ok(None);
        }

        let mut states = self.states.write().await;
        let current = states.get(container_id).copied().unwrap_or(ContainerState::Creating);
        if current != ContainerState::Stopped && current != ContainerState::Removed {
            states.insert(container_id.to_string(), actual);
            drop(states);
            self.stopped_since.write().await.entry(container_id.to_string()).or_insert_with(Instant::now);
            self.events.publish(ContainerEvent::Stopped {
                container_id: container_id.to_string(),
                exit_code: state.exit_code,
            });
        }

        Ok(Some(state.exit_code.unwrap_or(-1)))
    }

    pub fn to_lifecycle_state(docker_status: ContainerStateStatusEnum) -> ContainerState {
        match docker_status {
            ContainerStateStatusEnum::CREATED => ContainerState::Created,
            ContainerStateStatusEnum::RUNNING => ContainerState::Running,
            ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD => ContainerState::Stopped,
            ContainerStateStatusEnum::REMOVING => ContainerState::Removing,
            _ => ContainerState::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_docker_status_to_lifecycle_state() {
        assert_eq!(
            ContainerLifecycleManager::to_lifecycle_state(ContainerStateStatusEnum::RUNNING),
            ContainerState::Running
        );
        assert_eq!(
            ContainerLifecycleManager::to_lifecycle_state(ContainerStateStatusEnum::EXITED),
            ContainerState::Stopped
        );
    }
}
