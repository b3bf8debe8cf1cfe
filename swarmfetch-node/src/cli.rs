//! Command-line argument parsing.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Peer-assisted asset delivery node.
#[derive(Parser, Debug, Clone)]
#[command(name = "swarmfetch")]
#[command(about = "Seed assets to the swarm and fetch them with HTTP fallback")]
#[command(version)]
pub struct Cli {
    /// Data directory for content and the peer cache.
    #[arg(long, global = true, default_value = "~/.swarmfetch")]
    pub data_dir: PathBuf,

    /// Peer listen address.
    #[arg(long, global = true, default_value = "0.0.0.0:47821")]
    pub listen: SocketAddr,

    /// UDP port for LAN beacons.
    #[arg(long, global = true, default_value_t = 47822)]
    pub beacon_port: u16,

    /// Disable LAN beacons.
    #[arg(long, global = true)]
    pub no_beacon: bool,

    /// Comma-separated list of peers to dial on start.
    #[arg(long, global = true, value_delimiter = ',')]
    pub bootstrap: Option<Vec<SocketAddr>>,

    /// Comma-separated list of HTTP mirror base URLs.
    #[arg(long, global = true, value_delimiter = ',')]
    pub mirrors: Option<Vec<String>>,

    /// Do not serve internet peers.
    #[arg(long, global = true)]
    pub no_upload: bool,

    /// Do not serve peers on the local network.
    #[arg(long, global = true)]
    pub no_local_upload: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Join the swarm and serve content until interrupted.
    Run,
    /// Download one asset and exit.
    Fetch {
        /// Asset URL; a 32 or 40 hex digit path segment enables peer racing.
        url: String,
        /// Expected size in bytes.
        #[arg(long)]
        size: Option<u64>,
        /// Output file.
        #[arg(long, short)]
        output: PathBuf,
    },
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Expand the data directory path (handle ~ for home).
    pub fn expanded_data_dir(&self) -> PathBuf {
        let path_str = self.data_dir.to_string_lossy();
        if let Some(stripped) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        }
        self.data_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cli = Cli::parse_from(["swarmfetch", "run"]);
        assert_eq!(cli.command, Command::Run);
        assert_eq!(cli.listen.port(), 47821);
        assert_eq!(cli.beacon_port, 47822);
        assert!(!cli.no_upload);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_fetch_command() {
        let cli = Cli::parse_from([
            "swarmfetch",
            "fetch",
            "https://cdn.example/objects/da39a3ee5e6b4b0d3255bfef95601890afd80709",
            "--size",
            "0",
            "-o",
            "/tmp/empty",
            "--no-beacon",
        ]);
        match cli.command {
            Command::Fetch { size, output, .. } => {
                assert_eq!(size, Some(0));
                assert_eq!(output, PathBuf::from("/tmp/empty"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(cli.no_beacon);
    }

    #[test]
    fn test_peer_and_mirror_lists() {
        let cli = Cli::parse_from([
            "swarmfetch",
            "--bootstrap",
            "127.0.0.1:47821,192.168.1.7:47821",
            "--mirrors",
            "https://a.example,https://b.example",
            "run",
        ]);
        assert_eq!(cli.bootstrap.unwrap().len(), 2);
        assert_eq!(cli.mirrors.unwrap().len(), 2);
    }

    #[test]
    fn test_home_expansion() {
        let cli = Cli::parse_from(["swarmfetch", "--data-dir", "/srv/swarm", "run"]);
        assert_eq!(cli.expanded_data_dir(), PathBuf::from("/srv/swarm"));

        if let Some(home) = dirs::home_dir() {
            let cli = Cli::parse_from(["swarmfetch", "run"]);
            assert_eq!(cli.expanded_data_dir(), home.join(".swarmfetch"));
        }
    }
}
