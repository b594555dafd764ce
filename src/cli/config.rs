//! CLI configuration module
//!
//! Merges command-line arguments into the runtime configuration shared by
//! the fetch and serve subcommands.

use std::path::PathBuf;

use anyhow::Result;

use crate::cache::TorrentCache;
use crate::cli::args::CliArgs;

/// Configuration for the resolver front-ends
#[derive(Debug, Clone)]
pub struct Config {
    /// Announce to the magnet's trackers
    pub use_trackers: bool,
    /// Also announce to the built-in public tracker list
    pub use_additional_trackers: bool,
    /// Run a DHT node as a peer source
    pub use_dht: bool,
    /// UDP port for the DHT node
    pub dht_port: u16,
    /// DHT state file
    pub dht_state_file: Option<PathBuf>,
    /// Metadata cache directory
    pub cache_dir: Option<PathBuf>,
    /// Concurrent peer connections per request
    pub max_peer_connections: usize,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        Self {
            use_trackers: !args.no_trackers,
            use_additional_trackers: args.additional_trackers,
            use_dht: !args.no_dht,
            dht_port: args.dht_port,
            dht_state_file: args.dht_state_file.clone(),
            cache_dir: args.cache_dir.clone(),
            max_peer_connections: args.max_peer_connections,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_peer_connections == 0 {
            return Err(anyhow::anyhow!("max_peer_connections must be at least 1"));
        }

        if !self.use_trackers && !self.use_dht {
            return Err(anyhow::anyhow!(
                "all peer sources disabled; enable trackers or the DHT"
            ));
        }

        Ok(())
    }

    /// Check if the DHT should be enabled
    pub fn is_dht_enabled(&self) -> bool {
        self.use_dht
    }

    /// Check if trackers should be used
    pub fn is_tracker_enabled(&self) -> bool {
        self.use_trackers
    }

    /// The metadata cache, when a cache directory is configured
    pub fn cache(&self) -> Option<TorrentCache> {
        self.cache_dir.as_ref().map(TorrentCache::new)
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
