//! Magnet resolver
//!
//! The race coordinator: fans out to every tracker and the DHT in
//! parallel, funnels discovered endpoints into a bounded pool of
//! peer-wire workers, and returns the first metadata blob that verifies
//! against the info hash.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::TorrentCache;
use crate::dht::DhtNode;
use crate::error::FetchError;
use crate::peer::pool::{PeerWorkerPool, DEFAULT_MAX_WORKERS};
use crate::protocol::Handshake;
use crate::torrent::builder::{torrent_file_name, TorrentBuilder};
use crate::torrent::magnet::MagnetInfo;
use crate::tracker::http::HttpTrackerClient;
use crate::tracker::udp::UdpTrackerClient;

/// Well-known public trackers appended when additional trackers are
/// requested
pub const DEFAULT_TRACKERS: &[&str] = &[
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://open.stealth.si:80/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://exodus.desync.com:6969/announce",
    "udp://tracker.tiny-vps.com:6969/announce",
    "udp://tracker.moeking.me:6969/announce",
    "udp://open.demonii.si:1337/announce",
    "udp://p4p.arenabg.com:1337/announce",
    "udp://retracker.lanta-net.ru:2710/announce",
    "udp://tracker.cyberia.is:6969/announce",
    "udp://tracker.openbittorrent.com:80/announce",
    "udp://zephir.monocul.us:6969/announce",
];

/// Capacity of the discovered-endpoint channel
const ENDPOINT_CHANNEL_SIZE: usize = 256;

/// Resolves one magnet link into a `.torrent` file
pub struct Magnet2Torrent {
    magnet: MagnetInfo,
    use_trackers: bool,
    use_additional_trackers: bool,
    dht: Option<Arc<DhtNode>>,
    cache: Option<TorrentCache>,
    max_peer_workers: usize,
    peer_id: [u8; 20],
    peer_port: u16,
}

impl Magnet2Torrent {
    /// Create a resolver for a parsed magnet link
    pub fn new(magnet: MagnetInfo) -> Self {
        Self {
            magnet,
            use_trackers: true,
            use_additional_trackers: false,
            dht: None,
            cache: None,
            max_peer_workers: DEFAULT_MAX_WORKERS,
            peer_id: Handshake::generate_peer_id(),
            peer_port: rand::thread_rng().gen_range(10000..60000),
        }
    }

    /// Attach a running DHT node as a peer source
    pub fn with_dht(mut self, dht: Arc<DhtNode>) -> Self {
        self.dht = Some(dht);
        self
    }

    /// Attach a metadata cache
    pub fn with_cache(mut self, cache: TorrentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Enable or disable tracker sources
    pub fn with_trackers(mut self, use_trackers: bool) -> Self {
        self.use_trackers = use_trackers;
        self
    }

    /// Also announce to the built-in public tracker list
    pub fn with_additional_trackers(mut self, use_additional_trackers: bool) -> Self {
        self.use_additional_trackers = use_additional_trackers;
        self
    }

    /// Cap the number of concurrent peer-wire workers
    pub fn with_max_peer_workers(mut self, max_peer_workers: usize) -> Self {
        self.max_peer_workers = max_peer_workers;
        self
    }

    /// The parsed magnet this resolver works on
    pub fn magnet(&self) -> &MagnetInfo {
        &self.magnet
    }

    /// Resolve the magnet: returns the output filename and the complete
    /// `.torrent` bytes.
    ///
    /// Individual source and peer failures are absorbed; the call fails
    /// only when every source is exhausted without a verified blob.
    pub async fn retrieve_torrent(&self) -> Result<(String, Vec<u8>)> {
        let info_hash = self.magnet.info_hash;
        info!("Resolving magnet {}", hex::encode(info_hash));

        if let Some(cache) = &self.cache {
            if let Some(blob) = cache.get(&info_hash).await {
                info!("Serving {} from cache", hex::encode(info_hash));
                return self.build_torrent(&blob);
            }
        }

        let (endpoint_tx, endpoint_rx) = mpsc::channel::<SocketAddr>(ENDPOINT_CHANNEL_SIZE);
        let mut sources: JoinSet<()> = JoinSet::new();

        if self.use_trackers {
            self.spawn_tracker_sources(&mut sources, &endpoint_tx)?;
        }
        if let Some(dht) = &self.dht {
            let dht = Arc::clone(dht);
            let tx = endpoint_tx.clone();
            sources.spawn(async move {
                dht.get_peers(info_hash, tx).await;
            });
        }
        // The pool sees the channel close once every source is done
        drop(endpoint_tx);

        let pool = PeerWorkerPool::new(info_hash, self.peer_id, self.max_peer_workers);
        let winner = pool.run(endpoint_rx).await;
        // A winner cancels the remaining sources; their in-flight
        // transactions die with their sockets
        sources.abort_all();

        let Some(blob) = winner else {
            warn!("All sources exhausted for {}", hex::encode(info_hash));
            return Err(FetchError::failed_to_fetch().into());
        };

        if let Some(cache) = &self.cache {
            cache.put_quietly(&info_hash, &blob).await;
        }
        self.build_torrent(&blob)
    }

    /// Spawn one announce task per tracker, dispatched on URL scheme
    fn spawn_tracker_sources(
        &self,
        sources: &mut JoinSet<()>,
        endpoint_tx: &mpsc::Sender<SocketAddr>,
    ) -> Result<()> {
        let http_client = Arc::new(HttpTrackerClient::new(self.peer_id, self.peer_port)?);

        for tracker in self.tracker_list() {
            let scheme = match Url::parse(&tracker) {
                Ok(url) => url.scheme().to_string(),
                Err(e) => {
                    warn!("Skipping unparseable tracker {}: {}", tracker, e);
                    continue;
                }
            };
            let info_hash = self.magnet.info_hash;
            let tx = endpoint_tx.clone();

            match scheme.as_str() {
                "http" | "https" => {
                    let client = Arc::clone(&http_client);
                    sources.spawn(async move {
                        match client.announce(&tracker, info_hash).await {
                            Ok(peers) => forward_endpoints(&tracker, peers, tx).await,
                            Err(e) => debug!("Tracker {} failed: {}", tracker, e),
                        }
                    });
                }
                "udp" => {
                    let client = UdpTrackerClient::new(self.peer_id, self.peer_port);
                    sources.spawn(async move {
                        match client.announce(&tracker, info_hash).await {
                            Ok(peers) => forward_endpoints(&tracker, peers, tx).await,
                            Err(e) => debug!("Tracker {} failed: {}", tracker, e),
                        }
                    });
                }
                other => {
                    warn!("Skipping tracker {} with unknown scheme {}", tracker, other);
                }
            }
        }

        Ok(())
    }

    /// The magnet's trackers, plus the public list when enabled
    fn tracker_list(&self) -> Vec<String> {
        let mut trackers = self.magnet.trackers.clone();
        if self.use_additional_trackers {
            trackers.extend(DEFAULT_TRACKERS.iter().map(|t| t.to_string()));
        }
        trackers
    }

    /// Wrap a verified `info` blob into the final torrent file
    fn build_torrent(&self, raw_info: &[u8]) -> Result<(String, Vec<u8>)> {
        let trackers = if self.use_trackers {
            self.tracker_list()
        } else {
            Vec::new()
        };
        let data = TorrentBuilder::new(trackers).build(raw_info)?;
        let file_name = torrent_file_name(&self.magnet, raw_info);
        info!("Built {} ({} bytes)", file_name, data.len());
        Ok((file_name, data))
    }
}

/// Push a tracker's peers into the shared endpoint channel
async fn forward_endpoints(tracker: &str, peers: Vec<SocketAddr>, tx: mpsc::Sender<SocketAddr>) {
    debug!("Tracker {} produced {} peers", tracker, peers.len());
    for peer in peers {
        if peer.port() == 0 {
            continue;
        }
        if tx.send(peer).await.is_err() {
            // Pool already finished
            return;
        }
    }
}
