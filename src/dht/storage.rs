//! DHT peer and token storage
//!
//! TTL-bounded stores used to answer `get_peers` and `announce_peer`
//! queries from other nodes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Maximum tracked info hashes / outstanding tokens
const MAX_ENTRIES: usize = 2000;

/// Peers announced to us, grouped by info hash, forgotten after a TTL
#[derive(Debug)]
pub struct PeerStore {
    ttl: Duration,
    peers: HashMap<[u8; 20], HashMap<SocketAddr, Instant>>,
}

impl PeerStore {
    /// Create a store with the given entry lifetime
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            peers: HashMap::new(),
        }
    }

    /// Record an announced peer for an info hash
    pub fn insert_peer(&mut self, info_hash: [u8; 20], peer: SocketAddr) {
        self.expire();
        if self.peers.len() >= MAX_ENTRIES && !self.peers.contains_key(&info_hash) {
            return;
        }
        self.peers.entry(info_hash).or_default().insert(peer, Instant::now());
    }

    /// Live peers for an info hash
    pub fn get_peers(&mut self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        self.expire();
        self.peers
            .get(info_hash)
            .map(|entry| entry.keys().copied().collect())
            .unwrap_or_default()
    }

    fn expire(&mut self) {
        let ttl = self.ttl;
        for entry in self.peers.values_mut() {
            entry.retain(|_, seen| seen.elapsed() < ttl);
        }
        self.peers.retain(|_, entry| !entry.is_empty());
    }
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

/// Tokens we handed out with `get_peers` responses.
///
/// A token is valid for one `announce_peer` from the same address for the
/// same info hash, within the TTL.
#[derive(Debug)]
pub struct TokenStore {
    ttl: Duration,
    tokens: HashMap<Vec<u8>, (SocketAddr, [u8; 20], Instant)>,
}

impl TokenStore {
    /// Create a store with the given token lifetime
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: HashMap::new(),
        }
    }

    /// Issue a token for a querier
    pub fn issue_token(&mut self, querier: SocketAddr, info_hash: [u8; 20]) -> Vec<u8> {
        use rand::Rng;
        self.expire();
        let token: [u8; 16] = rand::thread_rng().gen();
        if self.tokens.len() < MAX_ENTRIES {
            self.tokens.insert(token.to_vec(), (querier, info_hash, Instant::now()));
        }
        token.to_vec()
    }

    /// Verify and consume a token
    pub fn verify_token(&mut self, querier: SocketAddr, info_hash: [u8; 20], token: &[u8]) -> bool {
        self.expire();
        match self.tokens.get(token) {
            Some((addr, hash, _)) if addr.ip() == querier.ip() && *hash == info_hash => {
                self.tokens.remove(token);
                true
            }
            _ => false,
        }
    }

    fn expire(&mut self) {
        let ttl = self.ttl;
        self.tokens.retain(|_, (_, _, issued)| issued.elapsed() < ttl);
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}
