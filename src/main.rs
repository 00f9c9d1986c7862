//! Foreman daemon entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use foreman::infrastructure::config::{load_manifest, ConfigLoader};
use foreman::services::Supervisor;

#[derive(Parser)]
#[command(name = "foreman", version, about = "Deterministic scheduler for fleets of AI coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler against a data directory
    Start {
        /// Data directory holding project.yaml, tasks/, events/, runs/
        #[arg(long, env = "FOREMAN_DATA_DIR")]
        data_dir: PathBuf,
        /// Override the poll interval, seconds
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Plan every cycle but execute nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Check that config and project manifest parse cleanly
    Validate {
        #[arg(long, env = "FOREMAN_DATA_DIR")]
        data_dir: PathBuf,
    },
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            data_dir,
            poll_interval,
            dry_run,
        } => {
            let mut config =
                ConfigLoader::load(&data_dir).context("Failed to load configuration")?;
            if let Some(secs) = poll_interval {
                config.scheduler.poll_interval_secs = secs;
            }
            if dry_run {
                config.scheduler.dry_run = true;
            }
            init_tracing(&config.logging.level, &config.logging.format);

            // The spawn executor is deployment-specific and injected by
            // the embedding process; the bare daemon schedules, recovers,
            // and alerts.
            let supervisor =
                Supervisor::start_with_config(&data_dir, config, None, Vec::new()).await?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    let _ = shutdown_tx.send(true);
                }
            });

            supervisor.run(shutdown_rx).await
        }
        Commands::Validate { data_dir } => {
            let config = ConfigLoader::load(&data_dir).context("Invalid configuration")?;
            let manifest = load_manifest(&data_dir)
                .await
                .context("Invalid project manifest")?;
            println!(
                "ok: project '{}', poll every {}s, max {} concurrent",
                manifest.id, config.scheduler.poll_interval_secs, config.scheduler.max_concurrent
            );
            Ok(())
        }
    }
}
