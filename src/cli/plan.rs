// Show what `up` would create without touching the runtime
use crate::cli::load_config;
use crate::docker::memory::InMemoryProvider;
use crate::docker::ports::PortAllocator;
use crate::errors::Result;
use crate::orchestrator::EnvironmentOrchestrator;
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;

pub fn run(config_dir: Option<PathBuf>, show_env: bool) -> Result<()> {
    let config = Arc::new(load_config(config_dir)?);
    let orchestrator = EnvironmentOrchestrator::new(
        Arc::clone(&config),
        Arc::new(InMemoryProvider::new()),
        Arc::new(PortAllocator::new()),
    );

    println!("{}", "Environment plan".bold());
    println!("{}", "═".repeat(80));
    println!("Network: {}", orchestrator.network_name());

    for plan in orchestrator.plan()? {
        println!();
        println!("{}", plan.service.cyan().bold());
        println!("  image:   {} (from {})", plan.image, plan.source_dir.display());
        for spec in [&plan.store, &plan.app] {
            println!(
                "  {:<45} {}:{} -> {}  ready on {}",
                spec.name.to_string(),
                config.host,
                spec.port.host,
                spec.port.container,
                spec.readiness.describe()
            );
            if show_env {
                for (key, value) in &spec.env {
                    println!("      {}={}", key, value);
                }
            }
        }
    }

    Ok(())
}
