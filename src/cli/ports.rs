use crate::cli::load_config;
use crate::config::Config;
use crate::docker::ports::PortAllocator;
use crate::errors::Result;
use std::path::PathBuf;

/// Reserve `count` host ports from the range and print them
///
/// The reservation lasts only as long as this process, so this shows which
/// ports a build started right now would receive. Bounds left unset come
/// from the configured range.
pub fn run(config_dir: Option<PathBuf>, count: usize, start: Option<u16>, end: Option<u16>) -> Result<()> {
    let config = load_config(config_dir)?;
    let (start, end) = range(&config, start, end);
    let allocator = PortAllocator::new();

    for i in 0..count {
        allocator.allocate_for(&format!("port-{}", i + 1), start, end)?;
    }

    println!("{:<15} {:<10}", "HOLDER", "PORT");
    println!("{}", "-".repeat(25));
    for lease in allocator.list_all() {
        println!("{:<15} {:<10}", lease.holder, lease.port);
    }

    Ok(())
}

fn range(config: &Config, start: Option<u16>, end: Option<u16>) -> (u16, u16) {
    (
        start.unwrap_or(config.ports.start),
        end.unwrap_or(config.ports.end),
    )
}
