//! One bridge network per repository, attached/detached per ephemeral
//! container's lifetime.

use bollard::network::{CreateNetworkOptions, DisconnectNetworkOptions};
use bollard::Docker;

use crate::common::network_name::network_name;
use crate::error::{OrchestratorError, Result};

pub struct NetworkIsolation {
    docker: Docker,
}

impl NetworkIsolation {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Idempotent: inspects first, creates only if absent.
    pub async fn ensure_network(&self, repository: &str) -> Result<String> {
        let name = network_name(repository);

        match self.docker.inspect_network::<String>(&name, None).await {
            Ok(_) => Ok(name),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                self.docker
                    .create_network(CreateNetworkOptions {
                        name: name.as_str(),
                        driver: "bridge",
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| OrchestratorError::Daemon(e.to_string()))?;
                Ok(name)
            }
            Err(e) => Err(OrchestratorError::Daemon(e.to_string())),
        }
    }

    pub async fn detach(&self, network: &str, container_id: &str) -> Result<()> {
        match self
            .docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions { container: container_id, force: true },
            )
            .await
        {
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(OrchestratorError::Daemon(e.to_string())),
        }
    }

    pub fn alias_for(runner_name: &str) -> String {
        runner_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_defaults_to_runner_name() {
        assert_eq!(NetworkIsolation::alias_for("ephemeral-o-r-abc123"), "ephemeral-o-r-abc123");
    }
}
