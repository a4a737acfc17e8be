//! CLI for talking to a raftroute node

use clap::{Parser, Subcommand};
use raftroute::node::NodeClient;
use raftroute::Error;

#[derive(Parser)]
#[command(name = "raftroute")]
#[command(about = "raftroute replicated key-value store CLI")]
#[command(version)]
struct Cli {
    /// Node HTTP address
    #[arg(long, default_value = "localhost:11000")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key from the node's local state
    Get {
        key: String,
    },

    /// Set a key (leader only)
    Set {
        key: String,
        value: String,
    },

    /// Delete a key (leader only)
    Delete {
        key: String,
    },

    /// Ask the node to add another node to its cluster
    Join {
        /// Joining node ID
        #[arg(long)]
        id: String,

        /// Joining node's raft address
        #[arg(long)]
        addr: String,
    },

    /// Show the node's raft state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli).await {
        if let Some(hint) = retry_hint(&e) {
            eprintln!("{}", hint);
        }
        return Err(e.into());
    }
    Ok(())
}

fn retry_hint(err: &Error) -> Option<&'static str> {
    if !err.is_retryable() {
        return None;
    }
    Some(match err {
        Error::NotLeader(_) => "hint: send the request to the leader",
        _ => "hint: the request may succeed if retried",
    })
}

async fn run(cli: &Cli) -> raftroute::Result<()> {
    let client = NodeClient::new(&cli.node)?;

    match &cli.command {
        Commands::Get { key } => {
            println!("{}", client.get(key).await?);
        }

        Commands::Set { key, value } => {
            client.set(key, value).await?;
            println!("OK");
        }

        Commands::Delete { key } => {
            client.delete(key).await?;
            println!("OK");
        }

        Commands::Join { id, addr } => {
            client.join(id, addr).await?;
            println!("{} ({}) joined via {}", id, addr, cli.node);
        }

        Commands::Status => {
            let status = client.status().await?;
            let health = client.health().await?;
            println!("Node status:");
            println!("  Node: {}", status.node);
            println!("  State: {}", status.state);
            println!("  Leader: {}", health["leader"].as_str().unwrap_or("unknown"));
            println!("  Term: {}", health["term"]);
            println!("  Last log index: {}", health["last_log_index"]);
            println!("  Last applied: {}", health["last_applied"]);
            println!("  Last snapshot: {}", health["last_snapshot_index"]);
        }
    }

    Ok(())
}
