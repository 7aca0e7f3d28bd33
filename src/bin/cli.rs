//! Operator CLI for a running repfs cluster

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use repfs::Client;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "repfs")]
#[command(about = "repfs client: store, load, list and remove files")]
struct Cli {
    /// Controller address
    #[arg(long, global = true, default_value = "127.0.0.1:4000")]
    controller: SocketAddr,

    /// Reply timeout in milliseconds
    #[arg(long, global = true, default_value = "3000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a local file under its file name
    Store {
        /// File to upload
        file: PathBuf,
    },
    /// Load a file and write it out
    Load {
        /// Stored file name
        name: String,
        /// Output path (defaults to the file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove a stored file
    Remove { name: String },
    /// List stored files
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut client = Client::connect(cli.controller, Duration::from_millis(cli.timeout_ms))
        .await
        .with_context(|| format!("connecting to controller {}", cli.controller))?;

    match cli.command {
        Commands::Store { file } => {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("file has no usable name")?
                .to_string();
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let targets = client.store(&name, &data).await?;
            println!("stored {} ({} bytes) on nodes {:?}", name, data.len(), targets);
        }
        Commands::Load { name, output } => {
            let data = client.load(&name).await?;
            let path = output.unwrap_or_else(|| PathBuf::from(&name));
            tokio::fs::write(&path, &data)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!("loaded {} ({} bytes) to {}", name, data.len(), path.display());
        }
        Commands::Remove { name } => {
            client.remove(&name).await?;
            println!("removed {}", name);
        }
        Commands::List => {
            let mut files = client.list().await?;
            files.sort();
            for name in files {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
