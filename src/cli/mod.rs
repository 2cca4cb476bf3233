// Command-line entry points
use crate::config::Config;
use crate::docker::cli::DockerCli;
use crate::docker::provider::InfrastructureProvider;
use crate::errors::{Result, TbError};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

pub mod images;
pub mod plan;
pub mod ports;
pub mod up;

/// Load `.testbed.yml` from `dir`, or the current directory when unset
pub fn load_config(dir: Option<PathBuf>) -> Result<Config> {
    let dir = match dir {
        Some(dir) => dir,
        None => env::current_dir()?,
    };
    Config::load(&dir)
}

/// Docker CLI provider, failing early when the daemon is unreachable
pub async fn docker_provider(config: &Config) -> Result<Arc<dyn InfrastructureProvider>> {
    let docker = DockerCli::new(&config.host)?;
    if !docker.is_docker_available().await {
        return Err(TbError::ProviderError(
            "docker is not available; is the daemon running?".to_string(),
        ));
    }
    Ok(Arc::new(docker))
}
