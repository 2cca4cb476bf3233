// Image maintenance
use crate::cli::{docker_provider, load_config};
use crate::docker::images::ImageProvisioner;
use crate::errors::{Result, TbError};
use colored::*;
use std::path::PathBuf;

/// Remove every configured service image
pub async fn clean(config_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_dir)?;
    let provider = docker_provider(&config).await?;
    let images = ImageProvisioner::new(provider, &config.build_descriptor);

    let mut failures = Vec::new();
    for service in &config.services {
        match images.remove(&service.image).await {
            Ok(true) => println!("{} Removed {}", "✓".green(), service.image),
            Ok(false) => println!("{} {} not present", "-".dimmed(), service.image),
            Err(e) => {
                println!("{} {}: {}", "✗".red(), service.image, e);
                failures.push(format!("image '{}': {}", service.image, e));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(TbError::TeardownFailure(failures))
    }
}
