//! Storage node binary

use anyhow::Result;
use clap::Parser;
use repfs::common::config::FileConfig;
use repfs::NodeServer;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "repfs-node")]
#[command(about = "repfs storage node: holds file replicas on local disk")]
struct Args {
    /// Bind address for the peer data plane
    #[arg(short, long)]
    bind: Option<String>,

    /// Controller address to join
    #[arg(short, long)]
    controller: Option<String>,

    /// Data-plane read / ack timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Directory holding the stored blobs (wiped on startup)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let file = FileConfig::load();
    let mut config = file.node.unwrap_or_default();
    if let Some(bind) = args.bind {
        config.bind_addr = bind.parse()?;
    }
    if let Some(controller) = args.controller {
        config.controller_addr = controller.parse()?;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    NodeServer::new(config).serve().await?;

    Ok(())
}
