//! Controller binary

use clap::{Parser, Subcommand};
use repfs::common::config::FileConfig;
use repfs::{Controller, ControllerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "repfs-controller")]
#[command(about = "repfs controller: placement, quorums and rebalancing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller
    Serve {
        /// Bind address for the control protocol
        #[arg(long)]
        bind: Option<String>,

        /// Target replicas per file
        #[arg(long)]
        replication: Option<usize>,

        /// Quorum / probe timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Period between automatic rebalance rounds in milliseconds
        #[arg(long)]
        rebalance_period_ms: Option<u64>,

        /// Disable automatic rebalance rounds
        #[arg(long)]
        no_rebalance: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            replication,
            timeout_ms,
            rebalance_period_ms,
            no_rebalance,
        } => {
            // file config first, CLI flags take priority
            let file = FileConfig::load();
            let mut config = file.controller.unwrap_or_default();
            if let Some(bind) = bind {
                config.bind_addr = bind.parse()?;
            }
            if let Some(replication) = replication {
                config.replication = replication;
            }
            if let Some(timeout_ms) = timeout_ms {
                config.timeout_ms = timeout_ms;
            }
            if let Some(period) = rebalance_period_ms {
                config.rebalance_period_ms = period;
            }
            if no_rebalance {
                config.auto_rebalance = false;
            }
            Controller::new(config).serve().await?;
        }
    }

    Ok(())
}
