// Container launch: start one container, then block until it is ready
use crate::clock::{Clock, SystemClock};
use crate::docker::provider::{ContainerHandle, InfrastructureProvider, PortBinding};
use crate::errors::{Result, TbError};
use crate::naming::ResourceName;
use crate::readiness::{PollSettings, ReadinessPolicy, ReadinessProbe};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything needed to start one container, fixed before launch
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, also its alias on the network
    pub name: ResourceName,
    pub image: String,
    pub network: ResourceName,
    pub port: PortBinding,
    pub env: BTreeMap<String, String>,
    /// Container that must be running and ready before this one starts
    pub depends_on: Option<ResourceName>,
    pub readiness: ReadinessPolicy,
    pub poll: PollSettings,
}

/// Starts containers and waits for their readiness condition
#[derive(Clone)]
pub struct ContainerLauncher {
    provider: Arc<dyn InfrastructureProvider>,
    clock: Arc<dyn Clock>,
}

impl ContainerLauncher {
    pub fn new(provider: Arc<dyn InfrastructureProvider>) -> Self {
        Self::new_with_clock(provider, Arc::new(SystemClock))
    }

    pub fn new_with_clock(provider: Arc<dyn InfrastructureProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { provider, clock }
    }

    /// Start `spec` and return its handle once the readiness condition holds
    ///
    /// `dependency` must be the already-started container named by
    /// `spec.depends_on`; this never starts dependencies itself. If the
    /// container fails to start or never becomes ready it is stopped and
    /// removed before the error is returned.
    pub async fn launch(
        &self,
        spec: &ContainerSpec,
        dependency: Option<&ContainerHandle>,
    ) -> Result<ContainerHandle> {
        self.check_dependency(spec, dependency).await?;

        tracing::info!(
            container = %spec.name,
            image = %spec.image,
            host_port = spec.port.host,
            "starting container"
        );

        let handle = match self.provider.run_container(spec).await {
            Ok(handle) => handle,
            // The name belongs to a container this call did not create
            Err(e @ TbError::NameConflict(_)) => return Err(e),
            Err(e) => {
                self.discard(&spec.name).await;
                return Err(e);
            }
        };

        let probe = ReadinessProbe::new(Arc::clone(&self.provider), Arc::clone(&self.clock));
        match probe.wait(&handle, &spec.readiness, &spec.poll).await {
            Ok(attempts) => {
                tracing::info!(container = %spec.name, attempts, "container ready");
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!(container = %spec.name, error = %e, "container never became ready");
                self.discard(&spec.name).await;
                Err(e)
            }
        }
    }

    async fn check_dependency(
        &self,
        spec: &ContainerSpec,
        dependency: Option<&ContainerHandle>,
    ) -> Result<()> {
        let Some(expected) = &spec.depends_on else {
            return Ok(());
        };

        let dependency = match dependency {
            Some(dep) if &dep.name == expected => dep,
            _ => return Err(TbError::DependencyNotRunning(expected.to_string())),
        };

        match self.provider.is_running(&dependency.name).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TbError::DependencyNotRunning(expected.to_string())),
            Err(e) if e.is_not_found() => Err(TbError::DependencyNotRunning(expected.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Stop then remove `name`; an absent container counts as removed
    ///
    /// A failed stop is logged and removal is still attempted, since the
    /// runtime removes a running container when forced.
    pub async fn stop_and_remove(&self, name: &ResourceName) -> Result<()> {
        match self.provider.stop_container(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => tracing::warn!(container = %name, error = %e, "failed to stop container"),
        }
        match self.provider.remove_container(name).await {
            Ok(()) => {
                tracing::debug!(container = %name, "removed container");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Best-effort stop and remove; leaves nothing running behind a failed launch
    async fn discard(&self, name: &ResourceName) {
        if let Err(e) = self.stop_and_remove(name).await {
            tracing::error!(container = %name, error = %e, "failed to remove container");
        }
    }
}
