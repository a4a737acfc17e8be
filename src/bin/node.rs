//! Node binary

use clap::Parser;
use raftroute::{Node, RaftConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "raftroute-node")]
#[command(about = "raftroute replicated key-value node")]
struct Cli {
    /// Load the node from a JSON/TOML config file instead of flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node ID (defaults to the raft bind address)
    #[arg(long)]
    id: Option<String>,

    /// HTTP API bind address
    #[arg(long, default_value = "localhost:11000")]
    haddr: String,

    /// Raft bind address
    #[arg(long, default_value = "localhost:12000")]
    raddr: String,

    /// HTTP address of a node to join
    #[arg(long)]
    join: Option<String>,

    /// Keep snapshots in memory
    #[arg(long)]
    inmem: bool,

    /// Where to write the {State, NodeAddr} routing file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Raft storage directory
    raft_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = match &cli.config {
        Some(path) => {
            let config = RaftConfig::load(path)?;
            tracing::info!("Raft configuration loaded from {}", path.display());
            config
        }
        None => {
            let raft_dir = cli
                .raft_dir
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no raft storage directory specified"))?;
            std::fs::create_dir_all(&raft_dir)?;
            let id = cli.id.clone().unwrap_or_else(|| cli.raddr.clone());
            RaftConfig::for_node(id, &cli.haddr, &cli.raddr, raft_dir, cli.join.clone())
        }
    };
    if cli.inmem {
        config.inmem = true;
    }
    if let Some(path) = cli.state_file {
        config.state_file = path;
    }

    Node::new(config).serve().await?;
    tracing::info!("raftroute node exiting");
    Ok(())
}
