// Build an environment, report its endpoints and tear it down again
use crate::cli::{docker_provider, load_config};
use crate::docker::ports::PortAllocator;
use crate::errors::Result;
use crate::orchestrator::{EnvironmentOrchestrator, ManagedEnvironment};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;

pub async fn run(config_dir: Option<PathBuf>, hold: bool, remove_images: bool) -> Result<()> {
    let config = Arc::new(load_config(config_dir)?);
    let provider = docker_provider(&config).await?;
    let mut orchestrator =
        EnvironmentOrchestrator::new(config, provider, Arc::new(PortAllocator::new()));
    cycle(&mut orchestrator, hold, remove_images).await
}

/// Build, optionally wait for Ctrl+C, then tear down
///
/// A failed build is reported ahead of any teardown failure that follows it.
async fn cycle(orchestrator: &mut EnvironmentOrchestrator, hold: bool, remove_images: bool) -> Result<()> {
    println!("Building environment {}...", orchestrator.id().to_string().cyan());
    let built = match orchestrator.build().await {
        Ok(env) => {
            print_environment(env);
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            Err(e)
        }
    };

    if built.is_ok() && hold {
        println!();
        println!("Environment is up. Press Ctrl+C to tear it down.");
        tokio::signal::ctrl_c().await?;
        println!();
    }

    println!("Tearing down environment...");
    match orchestrator.dispose_services().await {
        Ok(()) => println!("{} Services removed", "✓".green()),
        // The build error is the one worth reporting
        Err(e) if built.is_err() => {
            tracing::error!(environment = %orchestrator.id(), error = %e, "teardown after failed build");
            println!("{} Teardown failed: {}", "✗".red(), e);
            return built;
        }
        Err(e) => return Err(e),
    }

    if remove_images {
        orchestrator.dispose_images().await?;
        println!("{} Images removed", "✓".green());
    }

    built
}

fn print_environment(env: &ManagedEnvironment) {
    println!();
    println!("{}", "Environment ready".bold());
    println!("{}", "═".repeat(70));
    println!("{:<26} {:<24} {:<10}", "SERVICE", "ENDPOINT", "IMAGE");
    println!("{}", "-".repeat(70));

    for service in &env.services {
        let image = if service.image.built { "built" } else { "cached" };
        println!(
            "{:<26} {:<24} {:<10}",
            service.service.cyan(),
            format!("{}:{}", env.host, service.port),
            image
        );
    }
    println!();
    println!("Network: {}", env.network.name);
}
