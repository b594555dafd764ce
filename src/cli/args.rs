//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// CLI arguments for the magnet resolver
#[derive(Debug, Parser)]
#[command(name = "magnet2torrent")]
#[command(about = "Turn a magnet link into a .torrent file", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable tracker peer sources
    #[arg(long, global = true)]
    pub no_trackers: bool,

    /// Also announce to the built-in public tracker list
    #[arg(long, global = true)]
    pub additional_trackers: bool,

    /// Disable the DHT peer source
    #[arg(long, global = true)]
    pub no_dht: bool,

    /// UDP port for the DHT node
    #[arg(long, global = true, default_value_t = 6881)]
    pub dht_port: u16,

    /// DHT state file, restored at start and saved while running
    #[arg(long, global = true, value_name = "FILE")]
    pub dht_state_file: Option<PathBuf>,

    /// Metadata cache directory
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Maximum concurrent peer connections per request
    #[arg(long, global = true, default_value_t = 50)]
    pub max_peer_connections: usize,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch a torrent and save it locally
    Fetch {
        /// Magnet link
        magnet: String,

        /// Directory to write the .torrent file into
        #[arg(short, long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Run an HTTP server that serves torrents via an API or directly
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        ip: IpAddr,

        /// Port to listen on
        #[arg(long, default_value_t = 18667)]
        port: u16,

        /// Protect the endpoint with an API key (add apikey=<key> to the
        /// URL to access)
        #[arg(long)]
        apikey: Option<String>,
    },
}

impl CliArgs {
    /// Parse CLI arguments from the command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch() {
        let args = CliArgs::try_parse_from([
            "magnet2torrent",
            "fetch",
            "magnet:?xt=urn:btih:e2467cbf021192c241367b892230dc1e05c0580e",
        ])
        .unwrap();

        match &args.command {
            Command::Fetch { magnet, output_dir } => {
                assert!(magnet.starts_with("magnet:?"));
                assert!(output_dir.is_none());
            }
            other => panic!("expected fetch, got {:?}", other),
        }
        assert!(!args.no_dht);
        assert_eq!(args.dht_port, 6881);
        assert_eq!(args.max_peer_connections, 50);
    }

    #[test]
    fn test_parse_serve_with_options() {
        let args = CliArgs::try_parse_from([
            "magnet2torrent",
            "serve",
            "--port",
            "8080",
            "--apikey",
            "sekrit",
            "--no-dht",
            "--cache-dir",
            "/tmp/cache",
        ])
        .unwrap();

        match &args.command {
            Command::Serve { ip, port, apikey } => {
                assert_eq!(ip.to_string(), "0.0.0.0");
                assert_eq!(*port, 8080);
                assert_eq!(apikey.as_deref(), Some("sekrit"));
            }
            other => panic!("expected serve, got {:?}", other),
        }
        assert!(args.no_dht);
        assert_eq!(args.cache_dir.as_deref(), Some(std::path::Path::new("/tmp/cache")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(CliArgs::try_parse_from(["magnet2torrent"]).is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = CliArgs::try_parse_from(["magnet2torrent", "fetch", "magnet:?"]).unwrap();
        assert_eq!(args.log_level(), tracing::Level::INFO);
        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
