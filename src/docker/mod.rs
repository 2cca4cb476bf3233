// Container runtime integration: provider seam, Docker CLI and in-memory
// providers, and the resource managers built on top of them

pub mod cli;
pub mod images;
pub mod memory;
pub mod network;
pub mod ports;
pub mod provider;

pub use provider::{ContainerHandle, ExecOutput, InfrastructureProvider, NetworkHandle, PortBinding};
