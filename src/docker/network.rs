// Per-environment network lifecycle
use crate::docker::provider::{InfrastructureProvider, NetworkHandle};
use crate::errors::Result;
use crate::naming::ResourceName;
use std::sync::Arc;

/// Creates and destroys isolated networks
///
/// Callers must remove every attached container before `destroy`.
#[derive(Clone)]
pub struct NetworkManager {
    provider: Arc<dyn InfrastructureProvider>,
}

impl NetworkManager {
    pub fn new(provider: Arc<dyn InfrastructureProvider>) -> Self {
        Self { provider }
    }

    pub async fn create(&self, name: &ResourceName) -> Result<NetworkHandle> {
        let handle = self.provider.create_network(name).await?;
        tracing::info!(network = %name, "created network");
        Ok(handle)
    }

    /// Remove the network; an already absent network counts as removed
    pub async fn destroy(&self, name: &ResourceName) -> Result<()> {
        match self.provider.remove_network(name).await {
            Ok(()) => {
                tracing::info!(network = %name, "removed network");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(network = %name, "network already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
