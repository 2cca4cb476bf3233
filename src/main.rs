use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use testbed::cli;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "testbed")]
#[command(about = "Disposable multi-service container environments for end-to-end tests", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory containing .testbed.yml (defaults to the current directory)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an environment, print its endpoints, then tear it down
    Up {
        /// Keep the environment up until Ctrl+C
        #[arg(long)]
        hold: bool,
        /// Also remove the service images after teardown
        #[arg(long)]
        remove_images: bool,
    },
    /// Manage service images
    Images {
        #[command(subcommand)]
        command: ImagesCommands,
    },
    /// Show which free host ports would be handed out
    Ports {
        #[arg(long, default_value_t = 4)]
        count: usize,
        /// First port of the range; defaults to the configured range
        #[arg(long)]
        start: Option<u16>,
        /// Last port of the range; defaults to the configured range
        #[arg(long)]
        end: Option<u16>,
    },
    /// Print the containers, ports and environment a build would use
    Plan {
        /// Include container environment variables
        #[arg(long)]
        env: bool,
    },
}

#[derive(Subcommand)]
enum ImagesCommands {
    /// Remove every configured service image
    Clean,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Up {
            hold,
            remove_images,
        } => cli::up::run(cli.config_dir, hold, remove_images)
            .await
            .context("environment run failed")?,
        Commands::Images {
            command: ImagesCommands::Clean,
        } => cli::images::clean(cli.config_dir)
            .await
            .context("image cleanup failed")?,
        Commands::Ports { count, start, end } => cli::ports::run(cli.config_dir, count, start, end)?,
        Commands::Plan { env } => cli::plan::run(cli.config_dir, env)?,
    }

    Ok(())
}
