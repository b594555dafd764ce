//! DHT node
//!
//! The process-wide Kademlia node: owns the UDP socket, demultiplexes
//! replies to per-query waiters by transaction id, answers incoming
//! queries, and persists its identity and contacts across restarts.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::dht::krpc::{
    dict_bytes, dict_int, dict_node_id, generate_transaction_id, serialize_compact_nodes,
    serialize_compact_peer, Dict, KrpcMessage, QueryMethod,
};
use crate::dht::lookup;
use crate::dht::node::{Contact, NodeId};
use crate::dht::routing::{AddOutcome, RoutingTable, K};
use crate::dht::storage::{PeerStore, TokenStore};
use crate::error::FetchError;

/// Largest datagram we will parse; KRPC messages fit a typical MTU
const MAX_DATAGRAM_SIZE: usize = 1400;

/// Per-query reply timeout
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Send attempts per query before the contact is deemed unresponsive
const QUERY_ATTEMPTS: u32 = 2;

/// State file format version
const STATE_VERSION: u32 = 1;

/// Well-known bootstrap routers
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Abandoned pending transactions are swept after this long
const TRANSACTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of a single KRPC exchange
#[derive(Debug)]
enum QueryOutcome {
    Response(Dict),
    Error { code: i64, message: String },
}

/// A query awaiting its reply
struct PendingQuery {
    reply_tx: oneshot::Sender<QueryOutcome>,
    created_at: std::time::Instant,
}

/// A Kademlia DHT node
pub struct DhtNode {
    our_id: NodeId,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    routing: Arc<RwLock<RoutingTable>>,
    pending: Arc<Mutex<HashMap<Vec<u8>, PendingQuery>>>,
    peer_store: Arc<Mutex<PeerStore>>,
    token_store: Arc<Mutex<TokenStore>>,
}

impl DhtNode {
    /// Bind a new node with a random id on the given UDP port.
    ///
    /// A bind failure is fatal for the DHT facet.
    pub async fn bind(port: u16) -> Result<Arc<Self>> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        Self::bind_addr(addr, NodeId::random()).await
    }

    /// Bind a node with a known id on an explicit address
    pub async fn bind_addr(addr: SocketAddr, our_id: NodeId) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            FetchError::dht_error_full("Failed to bind DHT socket", addr.to_string(), e.to_string())
        })?;
        let local_addr = socket.local_addr().map_err(|e| {
            FetchError::dht_error_full("Failed to get local address", addr.to_string(), e.to_string())
        })?;

        info!("DHT node {} listening on {}", our_id.to_hex(), local_addr);
        Ok(Arc::new(Self {
            our_id,
            socket: Arc::new(socket),
            local_addr,
            routing: Arc::new(RwLock::new(RoutingTable::new(our_id))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            peer_store: Arc::new(Mutex::new(PeerStore::default())),
            token_store: Arc::new(Mutex::new(TokenStore::default())),
        }))
    }

    /// Our node id
    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    /// The bound socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of contacts in the routing table
    pub async fn node_count(&self) -> usize {
        self.routing.read().await.contact_count()
    }

    /// Spawn the receive loop. The loop runs until the node is dropped
    /// and the task is aborted.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.receive_loop().await;
        })
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = [0u8; 2048];
        let mut sweep = tokio::time::interval(TRANSACTION_SWEEP_INTERVAL);
        sweep.tick().await;

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("DHT receive error: {}", e);
                            continue;
                        }
                    };
                    if len > MAX_DATAGRAM_SIZE {
                        debug!("Dropping oversized datagram from {} ({} bytes)", from, len);
                        continue;
                    }
                    let message = match KrpcMessage::decode(&buf[..len]) {
                        Ok(message) => message,
                        Err(e) => {
                            trace!("Undecodable datagram from {}: {}", from, e);
                            continue;
                        }
                    };
                    self.handle_message(message, from).await;
                }
                // Queries whose callers were cancelled never remove their
                // pending entries; sweep them out
                _ = sweep.tick() => {
                    let mut pending = self.pending.lock().await;
                    let before = pending.len();
                    pending.retain(|_, query| query.created_at.elapsed() < TRANSACTION_SWEEP_INTERVAL);
                    let swept = before - pending.len();
                    if swept > 0 {
                        debug!("Swept {} abandoned transactions", swept);
                    }
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, message: KrpcMessage, from: SocketAddr) {
        match message {
            KrpcMessage::Response { transaction_id, body } => {
                if let Some(id) = dict_node_id(&body, b"id") {
                    self.welcome(Contact::new(id, from)).await;
                }
                let waiter = self.pending.lock().await.remove(&transaction_id);
                match waiter {
                    Some(query) => {
                        let _ = query.reply_tx.send(QueryOutcome::Response(body));
                    }
                    // Abandoned transactions (cancelled lookups, late
                    // retries) end up here and are discarded
                    None => trace!("Reply with unknown transaction id from {}", from),
                }
            }
            KrpcMessage::Error { transaction_id, code, message } => {
                debug!("KRPC error from {}: {} {}", from, code, message);
                if let Some(query) = self.pending.lock().await.remove(&transaction_id) {
                    let _ = query.reply_tx.send(QueryOutcome::Error { code, message });
                }
            }
            KrpcMessage::Query { transaction_id, method, args } => {
                self.handle_query(transaction_id, method, args, from).await;
            }
        }
    }

    /// Answer an incoming query
    async fn handle_query(
        self: &Arc<Self>,
        transaction_id: Vec<u8>,
        method: QueryMethod,
        args: Dict,
        from: SocketAddr,
    ) {
        let Some(querier_id) = dict_node_id(&args, b"id") else {
            trace!("Query without valid id from {}", from);
            return;
        };
        self.welcome(Contact::new(querier_id, from)).await;
        debug!("Received {} query from {}", method, from);

        let mut body = Dict::new();
        body.insert(b"id".to_vec(), Value::Bytes(self.our_id.as_bytes().to_vec()));

        match method {
            QueryMethod::Ping => {}
            QueryMethod::FindNode => {
                let Some(target) = dict_node_id(&args, b"target") else {
                    self.send_error(transaction_id, from, 203, "Missing target").await;
                    return;
                };
                let closest = self.routing.read().await.closest_contacts(&target, K);
                body.insert(b"nodes".to_vec(), Value::Bytes(serialize_compact_nodes(&closest)));
            }
            QueryMethod::GetPeers => {
                let Some(info_hash) = dict_bytes(&args, b"info_hash")
                    .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok())
                else {
                    self.send_error(transaction_id, from, 203, "Missing info_hash").await;
                    return;
                };
                let token = self.token_store.lock().await.issue_token(from, info_hash);
                body.insert(b"token".to_vec(), Value::Bytes(token));

                let peers = self.peer_store.lock().await.get_peers(&info_hash);
                if peers.is_empty() {
                    let target = NodeId::new(info_hash);
                    let closest = self.routing.read().await.closest_contacts(&target, K);
                    body.insert(b"nodes".to_vec(), Value::Bytes(serialize_compact_nodes(&closest)));
                } else {
                    let values = peers
                        .iter()
                        .filter_map(serialize_compact_peer)
                        .map(|compact| Value::Bytes(compact.to_vec()))
                        .collect();
                    body.insert(b"values".to_vec(), Value::List(values));
                }
            }
            QueryMethod::AnnouncePeer => {
                let Some(info_hash) = dict_bytes(&args, b"info_hash")
                    .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok())
                else {
                    self.send_error(transaction_id, from, 203, "Missing info_hash").await;
                    return;
                };
                let Some(token) = dict_bytes(&args, b"token") else {
                    self.send_error(transaction_id, from, 203, "Missing token").await;
                    return;
                };
                let port = if dict_int(&args, b"implied_port").unwrap_or(0) != 0 {
                    from.port()
                } else {
                    match dict_int(&args, b"port").and_then(|p| u16::try_from(p).ok()) {
                        Some(port) if port != 0 => port,
                        _ => {
                            self.send_error(transaction_id, from, 203, "Bad port").await;
                            return;
                        }
                    }
                };

                let token = token.to_vec();
                if self.token_store.lock().await.verify_token(from, info_hash, &token) {
                    let peer = SocketAddr::new(from.ip(), port);
                    debug!("Storing announced peer {} for {}", peer, hex::encode(info_hash));
                    self.peer_store.lock().await.insert_peer(info_hash, peer);
                } else {
                    debug!("Invalid announce token from {}", from);
                }
            }
        }

        self.send_message(KrpcMessage::response(transaction_id, body), from).await;
    }

    async fn send_error(self: &Arc<Self>, transaction_id: Vec<u8>, to: SocketAddr, code: i64, message: &str) {
        self.send_message(KrpcMessage::error(transaction_id, code, message), to).await;
    }

    async fn send_message(&self, message: KrpcMessage, to: SocketAddr) {
        match message.encode() {
            Ok(encoded) => {
                if let Err(e) = self.socket.send_to(&encoded, to).await {
                    debug!("Failed to send to {}: {}", to, e);
                }
            }
            Err(e) => warn!("Failed to encode KRPC message: {}", e),
        }
    }

    /// Insert a contact, running the eviction challenge when its bucket
    /// is full: the least-recently-seen contact is pinged and only
    /// replaced if it stays silent.
    async fn welcome(self: &Arc<Self>, contact: Contact) {
        let outcome = self.routing.write().await.add_contact(contact.clone());
        if let AddOutcome::Full { least_recently_seen } = outcome {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                match node.ping(least_recently_seen.addr).await {
                    Ok(_) => {
                        // Responsive: keep the old contact, drop the newcomer
                        node.routing.write().await.touch(&least_recently_seen.id);
                    }
                    Err(_) => {
                        debug!(
                            "Evicting unresponsive contact {} for {}",
                            least_recently_seen.addr, contact.addr
                        );
                        node.routing.write().await.replace(&least_recently_seen.id, contact);
                    }
                }
            });
        }
    }

    /// Drop a contact that failed to answer queries
    pub(crate) async fn forget_contact(&self, id: &NodeId) {
        self.routing.write().await.remove_contact(id);
    }

    /// The `count` closest known contacts to a target
    pub(crate) async fn closest_contacts(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.routing.read().await.closest_contacts(target, count)
    }

    /// Send a query and await the matching reply, retrying once.
    async fn query(&self, addr: SocketAddr, method: QueryMethod, args: Dict) -> Result<Dict> {
        for _attempt in 0..QUERY_ATTEMPTS {
            let transaction_id = self.register_transaction().await;
            let (reply_tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(
                transaction_id.clone(),
                PendingQuery {
                    reply_tx,
                    created_at: std::time::Instant::now(),
                },
            );

            let message = KrpcMessage::Query {
                transaction_id: transaction_id.clone(),
                method,
                args: args.clone(),
            };
            self.send_message(message, addr).await;

            match timeout(QUERY_TIMEOUT, rx).await {
                Ok(Ok(QueryOutcome::Response(body))) => return Ok(body),
                Ok(Ok(QueryOutcome::Error { code, message })) => {
                    return Err(FetchError::dht_error_full(
                        format!("Remote error {}", code),
                        addr.to_string(),
                        message,
                    )
                    .into());
                }
                Ok(Err(_)) | Err(_) => {
                    self.pending.lock().await.remove(&transaction_id);
                }
            }
        }

        Err(FetchError::dht_error_with_node("No reply", addr.to_string()).into())
    }

    /// Pick a transaction id no in-flight query is using
    async fn register_transaction(&self) -> Vec<u8> {
        let pending = self.pending.lock().await;
        loop {
            let candidate = generate_transaction_id();
            if !pending.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Ping a node
    pub async fn ping(&self, addr: SocketAddr) -> Result<Dict> {
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::Bytes(self.our_id.as_bytes().to_vec()));
        self.query(addr, QueryMethod::Ping, args).await
    }

    /// Issue a find_node query
    pub(crate) async fn find_node_query(&self, addr: SocketAddr, target: NodeId) -> Result<Dict> {
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::Bytes(self.our_id.as_bytes().to_vec()));
        args.insert(b"target".to_vec(), Value::Bytes(target.as_bytes().to_vec()));
        self.query(addr, QueryMethod::FindNode, args).await
    }

    /// Issue a get_peers query
    pub(crate) async fn get_peers_query(&self, addr: SocketAddr, info_hash: [u8; 20]) -> Result<Dict> {
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::Bytes(self.our_id.as_bytes().to_vec()));
        args.insert(b"info_hash".to_vec(), Value::Bytes(info_hash.to_vec()));
        self.query(addr, QueryMethod::GetPeers, args).await
    }

    /// Join the network: ping the seed routers, then crawl toward our own
    /// id to fill nearby buckets.
    pub async fn bootstrap(self: &Arc<Self>, seeds: &[String]) -> Result<usize> {
        info!("Bootstrapping DHT from {} seeds", seeds.len());
        let mut join_set = tokio::task::JoinSet::new();

        for seed in seeds {
            let Ok(mut addrs) = lookup_host(seed.as_str()).await else {
                warn!("Could not resolve bootstrap node {}", seed);
                continue;
            };
            let Some(addr) = addrs.find(|a| a.is_ipv4()) else {
                continue;
            };
            let node = Arc::clone(self);
            join_set.spawn(async move { node.ping(addr).await.is_ok() });
        }

        let mut responders = 0;
        while let Some(joined) = join_set.join_next().await {
            if matches!(joined, Ok(true)) {
                responders += 1;
            }
        }
        debug!("{} bootstrap nodes responded", responders);

        self.refresh().await;
        info!("DHT bootstrap complete: {} contacts", self.node_count().await);
        Ok(responders)
    }

    /// Refresh the buckets around our own id with a find_node crawl
    pub async fn refresh(self: &Arc<Self>) {
        lookup::find_node_crawl(Arc::clone(self), self.our_id).await;
    }

    /// Crawl the network for peers seeding `info_hash`, streaming each
    /// endpoint into `sink` as soon as it is heard of.
    pub async fn get_peers(self: &Arc<Self>, info_hash: [u8; 20], sink: mpsc::Sender<SocketAddr>) {
        lookup::get_peers_crawl(Arc::clone(self), info_hash, sink).await;
    }

    /// Persist our id and contacts to a versioned state file
    pub async fn save_state(&self, path: &Path) -> Result<()> {
        let contacts = self.routing.read().await.contacts();
        let state = PersistedState {
            version: STATE_VERSION,
            node_id: self.our_id.to_hex(),
            contacts: contacts
                .iter()
                .map(|c| PersistedContact {
                    id: c.id.to_hex(),
                    addr: c.addr.to_string(),
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&state).map_err(FetchError::from)?;
        tokio::fs::write(path, json).await.map_err(|e| {
            FetchError::storage_error_full("Failed to write DHT state", path.display().to_string(), e.to_string())
        })?;
        info!("Saved DHT state to {} ({} contacts)", path.display(), state.contacts.len());
        Ok(())
    }

    /// Rebuild a node from a state file, binding it on `port`.
    ///
    /// The caller should `start` the node and `refresh` (or `bootstrap`)
    /// it afterwards to revalidate the restored contacts.
    pub async fn load_state(path: &Path, port: u16) -> Result<Arc<Self>> {
        let json = tokio::fs::read(path).await.map_err(|e| {
            FetchError::storage_error_full("Failed to read DHT state", path.display().to_string(), e.to_string())
        })?;
        let state: PersistedState = serde_json::from_slice(&json).map_err(FetchError::from)?;
        if state.version != STATE_VERSION {
            return Err(FetchError::storage_error_with_path(
                format!("Unsupported DHT state version {}", state.version),
                path.display().to_string(),
            )
            .into());
        }
        let our_id = NodeId::from_hex(&state.node_id).ok_or_else(|| {
            FetchError::storage_error_with_path("Corrupt node id in DHT state", path.display().to_string())
        })?;

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let node = Self::bind_addr(addr, our_id).await?;
        {
            let mut routing = node.routing.write().await;
            for persisted in &state.contacts {
                let (Some(id), Ok(addr)) = (NodeId::from_hex(&persisted.id), persisted.addr.parse()) else {
                    continue;
                };
                let _ = routing.add_contact(Contact::new(id, addr));
            }
        }
        info!(
            "Restored DHT state from {}: id {}, {} contacts",
            path.display(),
            node.our_id.to_hex(),
            node.node_count().await
        );
        Ok(node)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedContact {
    id: String,
    addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    node_id: String,
    contacts: Vec<PersistedContact>,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_node() -> Arc<DhtNode> {
        DhtNode::bind_addr("127.0.0.1:0".parse().unwrap(), NodeId::random())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bind() {
        let node = test_node().await;
        assert_eq!(node.our_id().as_bytes().len(), 20);
        assert_eq!(node.node_count().await, 0);
        assert_ne!(node.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_ping_between_nodes() {
        let a = test_node().await;
        let b = test_node().await;
        a.start();
        b.start();

        let body = a.ping(b.local_addr()).await.unwrap();
        assert_eq!(dict_node_id(&body, b"id"), Some(b.our_id()));

        // Both sides learned about each other
        assert_eq!(a.node_count().await, 1);
        assert_eq!(b.node_count().await, 1);
    }

    #[tokio::test]
    async fn test_query_timeout_is_recoverable() {
        let a = test_node().await;
        a.start();
        // Nothing is listening here
        let silent: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = a.ping(silent).await;
        assert!(result.is_err());
        // The pending map must not leak abandoned transactions
        assert!(a.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_find_node_returns_compact_nodes() {
        let a = test_node().await;
        let b = test_node().await;
        let c = test_node().await;
        a.start();
        b.start();
        c.start();

        // b knows about c
        b.ping(c.local_addr()).await.unwrap();

        let body = a.find_node_query(b.local_addr(), NodeId::random()).await.unwrap();
        let nodes = dict_bytes(&body, b"nodes").unwrap();
        assert_eq!(nodes.len() % 26, 0);
        assert!(!nodes.is_empty());
    }

    #[tokio::test]
    async fn test_get_peers_returns_stored_values() {
        let a = test_node().await;
        let b = test_node().await;
        a.start();
        b.start();

        let info_hash = [7u8; 20];
        let peer: SocketAddr = "10.1.2.3:6889".parse().unwrap();
        b.peer_store.lock().await.insert_peer(info_hash, peer);

        let body = a.get_peers_query(b.local_addr(), info_hash).await.unwrap();
        assert!(dict_bytes(&body, b"token").is_some());
        let Some(Value::List(values)) = body.get(b"values".as_ref()) else {
            panic!("expected values");
        };
        assert_eq!(values.len(), 1);
    }

    #[tokio::test]
    async fn test_get_peers_crawl_streams_endpoints() {
        let a = test_node().await;
        let b = test_node().await;
        a.start();
        b.start();

        let info_hash = [9u8; 20];
        b.peer_store.lock().await.insert_peer(info_hash, "10.0.0.1:6881".parse().unwrap());
        // Zero-port peers must be filtered out of the stream
        b.peer_store.lock().await.insert_peer(info_hash, "10.0.0.2:0".parse().unwrap());

        // Teach a about b so the crawl has a seed
        a.ping(b.local_addr()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        a.get_peers(info_hash, tx).await;

        let mut peers = Vec::new();
        while let Some(peer) = rx.recv().await {
            peers.push(peer);
        }
        assert_eq!(peers, vec!["10.0.0.1:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_announce_peer_with_token() {
        let a = test_node().await;
        let b = test_node().await;
        a.start();
        b.start();

        let info_hash = [5u8; 20];
        // Fetch a token first
        let body = a.get_peers_query(b.local_addr(), info_hash).await.unwrap();
        let token = dict_bytes(&body, b"token").unwrap().to_vec();

        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::Bytes(a.our_id().as_bytes().to_vec()));
        args.insert(b"info_hash".to_vec(), Value::Bytes(info_hash.to_vec()));
        args.insert(b"port".to_vec(), Value::Int(7000));
        args.insert(b"token".to_vec(), Value::Bytes(token));
        a.query(b.local_addr(), QueryMethod::AnnouncePeer, args).await.unwrap();

        let peers = b.peer_store.lock().await.get_peers(&info_hash);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port(), 7000);
    }

    #[tokio::test]
    async fn test_save_and_load_state() {
        let a = test_node().await;
        let b = test_node().await;
        a.start();
        b.start();
        a.ping(b.local_addr()).await.unwrap();

        let path = std::env::temp_dir().join(format!(
            "magnet2torrent-dht-state-{}.json",
            rand::random::<u64>()
        ));
        a.save_state(&path).await.unwrap();

        let restored = DhtNode::load_state(&path, 0).await.unwrap();
        assert_eq!(restored.our_id(), a.our_id());
        assert_eq!(restored.node_count().await, 1);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_state_rejects_wrong_version() {
        let path = std::env::temp_dir().join(format!(
            "magnet2torrent-dht-state-{}.json",
            rand::random::<u64>()
        ));
        let state = serde_json::json!({
            "version": 99,
            "node_id": "00".repeat(20),
            "contacts": [],
        });
        tokio::fs::write(&path, serde_json::to_vec(&state).unwrap()).await.unwrap();

        assert!(DhtNode::load_state(&path, 0).await.is_err());
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
