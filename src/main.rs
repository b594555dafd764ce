//! magnet2torrent - Main entry point
//!
//! Resolves magnet links into .torrent files, either once from the
//! command line or continuously behind an HTTP API.

use anyhow::{Context, Result};
use magnet2torrent::{
    CliArgs, Command, Config, DhtNode, Magnet2Torrent, MagnetParser, ServerState,
    DEFAULT_BOOTSTRAP_NODES,
};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    // The DHT node is process-wide and long-lived; a bind failure only
    // degrades to tracker-only operation
    let dht = if config.is_dht_enabled() {
        match start_dht(&config).await {
            Ok(node) => Some(node),
            Err(e) => {
                warn!("DHT unavailable, continuing with trackers only: {}", e);
                None
            }
        }
    } else {
        None
    };

    match &args.command {
        Command::Fetch { magnet, output_dir } => {
            run_fetch(&config, dht, magnet, output_dir.as_deref()).await
        }
        Command::Serve { ip, port, apikey } => {
            run_serve(&config, dht, *ip, *port, apikey.clone()).await
        }
    }
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

/// Bring up the DHT node: restore persisted state when available, then
/// bootstrap from the well-known routers.
async fn start_dht(config: &Config) -> Result<Arc<DhtNode>> {
    let node = match &config.dht_state_file {
        Some(path) if path.exists() => match DhtNode::load_state(path, config.dht_port).await {
            Ok(node) => node,
            Err(e) => {
                warn!("Could not restore DHT state from {}: {}", path.display(), e);
                DhtNode::bind(config.dht_port).await?
            }
        },
        _ => DhtNode::bind(config.dht_port).await?,
    };

    node.start();

    let seeds: Vec<String> = DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect();
    if let Err(e) = node.bootstrap(&seeds).await {
        warn!("DHT bootstrap failed: {}", e);
    }

    Ok(node)
}

/// Fetch one magnet link and write the resulting torrent file
async fn run_fetch(
    config: &Config,
    dht: Option<Arc<DhtNode>>,
    magnet_uri: &str,
    output_dir: Option<&Path>,
) -> Result<()> {
    let magnet = MagnetParser::parse(magnet_uri)?;

    let mut resolver = Magnet2Torrent::new(magnet)
        .with_trackers(config.is_tracker_enabled())
        .with_additional_trackers(config.use_additional_trackers)
        .with_max_peer_workers(config.max_peer_connections);
    if let Some(dht) = &dht {
        resolver = resolver.with_dht(Arc::clone(dht));
    }
    if let Some(cache) = config.cache() {
        resolver = resolver.with_cache(cache);
    }

    let (file_name, torrent_data) = resolver
        .retrieve_torrent()
        .await
        .context("Unable to fetch magnet link")?;

    let path = output_dir.unwrap_or_else(|| Path::new(".")).join(&file_name);
    tokio::fs::write(&path, &torrent_data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Downloaded magnet link into file: {}", path.display());

    save_dht_state(&dht, &config.dht_state_file).await;
    Ok(())
}

/// Run the HTTP façade until interrupted
async fn run_serve(
    config: &Config,
    dht: Option<Arc<DhtNode>>,
    ip: IpAddr,
    port: u16,
    api_key: Option<String>,
) -> Result<()> {
    // Persist DHT state on a fixed cadence while serving
    if let (Some(dht), Some(path)) = (&dht, &config.dht_state_file) {
        let dht = Arc::clone(dht);
        let path = path.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = dht.save_state(&path).await {
                    warn!("Failed to save DHT state: {}", e);
                }
            }
        });
    }

    let state = Arc::new(ServerState {
        dht,
        cache: config.cache(),
        api_key,
        use_additional_trackers: config.use_additional_trackers,
        max_peer_workers: config.max_peer_connections,
    });

    info!("Starting HTTP server on {}:{}", ip, port);
    magnet2torrent::server::serve(state, SocketAddr::new(ip, port)).await
}

/// Persist DHT state if both a node and a state file are configured
async fn save_dht_state(dht: &Option<Arc<DhtNode>>, state_file: &Option<PathBuf>) {
    if let (Some(dht), Some(path)) = (dht, state_file) {
        if let Err(e) = dht.save_state(path).await {
            warn!("Failed to save DHT state: {}", e);
        }
    }
}
