//! Swarmfetch node binary.
//!
//! Seeds content to the peer swarm, or fetches a single asset by racing
//! peers against HTTP.

mod cli;
mod config;
mod node;
mod shutdown;

use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::config::NodeConfig;
use crate::node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    tracing::info!("Swarmfetch v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_cli(&cli);
    let node = Node::new(config).await?;

    match cli.command {
        Command::Run => node.run().await?,
        Command::Fetch { url, size, output } => {
            let downloaded = node.fetch(&url, size, &output).await?;
            println!("{} ({} bytes, {:?})", downloaded.path.display(), downloaded.bytes, downloaded.source);
        }
    }

    Ok(())
}
