// Infrastructure provider seam
// Everything the orchestrator needs from a container runtime, and nothing more

use crate::errors::Result;
use crate::launcher::ContainerSpec;
use crate::naming::ResourceName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

/// A created network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub name: ResourceName,
    pub id: String,
}

/// Host port published for a container port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

/// A started container
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub name: ResourceName,
    pub id: String,
    pub image: String,
    pub network: ResourceName,
    pub port: PortBinding,
    pub started_at: DateTime<Utc>,
}

impl ContainerHandle {
    /// Host port bound to `container_port`, if this container publishes it
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        (self.port.container == container_port).then_some(self.port.host)
    }
}

/// Result of a command executed inside a container
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Container, network and image primitives supplied by a runtime
///
/// Implementations return `TbError::NotFound` for resources that do not
/// exist so teardown paths can treat them as already removed.
#[async_trait]
pub trait InfrastructureProvider: Send + Sync {
    async fn create_network(&self, name: &ResourceName) -> Result<NetworkHandle>;

    async fn remove_network(&self, name: &ResourceName) -> Result<()>;

    async fn image_exists(&self, name: &str) -> Result<bool>;

    /// Build `name` from `context_dir` using the descriptor file inside it,
    /// discarding intermediate build state
    async fn build_image(&self, name: &str, context_dir: &Path, descriptor: &str) -> Result<()>;

    async fn remove_image(&self, name: &str) -> Result<()>;

    /// Create and start a container attached to the spec's network, aliased
    /// by its name
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn is_running(&self, name: &ResourceName) -> Result<bool>;

    async fn stop_container(&self, name: &ResourceName) -> Result<()>;

    async fn remove_container(&self, name: &ResourceName) -> Result<()>;

    async fn exec(&self, name: &ResourceName, command: &[String]) -> Result<ExecOutput>;

    /// Whether the host port bound to `container_port` accepts connections
    async fn check_port(&self, container: &ContainerHandle, container_port: u16) -> Result<bool>;

    /// Status code of a GET against `path` on the port bound to `container_port`
    async fn check_http(
        &self,
        container: &ContainerHandle,
        container_port: u16,
        path: &str,
    ) -> Result<u16>;
}
