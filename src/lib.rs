// Library interface for testbed
// Exposes the orchestration modules for integration tests and embedding

pub mod cli;
pub mod clock;
pub mod config;
pub mod docker;
pub mod errors;
pub mod launcher;
pub mod naming;
pub mod orchestrator;
pub mod readiness;

pub use config::Config;
pub use errors::{Result, TbError};
pub use orchestrator::{EnvironmentOrchestrator, EnvironmentState, ManagedEnvironment};
