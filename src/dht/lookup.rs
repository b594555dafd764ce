//! Iterative DHT lookups
//!
//! Kademlia crawls toward a target id: `get_peers` crawls stream peer
//! endpoints to a sink as they arrive, `find_node` crawls refresh the
//! routing table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_bencode::value::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::dht::dht::DhtNode;
use crate::dht::krpc::{dict_bytes, parse_compact_nodes, parse_compact_peer, Dict};
use crate::dht::node::{Contact, NodeId};
use crate::dht::routing::K;

/// Concurrent outstanding queries per crawl
pub const ALPHA: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Unqueried,
    Pending,
    Responded,
    Failed,
}

#[derive(Debug)]
struct Entry {
    contact: Contact,
    state: EntryState,
}

/// Shortlist of the closest contacts seen during a crawl
#[derive(Debug)]
pub struct Shortlist {
    target: NodeId,
    entries: Vec<Entry>,
    tokens: HashMap<NodeId, Vec<u8>>,
}

impl Shortlist {
    /// Create a shortlist seeded with the given contacts
    pub fn new(target: NodeId, seeds: Vec<Contact>) -> Self {
        let mut shortlist = Self {
            target,
            entries: Vec::new(),
            tokens: HashMap::new(),
        };
        for seed in seeds {
            shortlist.insert(seed);
        }
        shortlist
    }

    /// Add a contact, keeping entries sorted by distance to the target.
    /// Known ids are ignored, so a contact returning itself cannot reset
    /// its own query state.
    pub fn insert(&mut self, contact: Contact) {
        if self.entries.iter().any(|e| e.contact.id == contact.id) {
            return;
        }
        let distance = contact.distance_to(&self.target);
        let position = self
            .entries
            .partition_point(|e| e.contact.distance_to(&self.target) <= distance);
        self.entries.insert(
            position,
            Entry {
                contact,
                state: EntryState::Unqueried,
            },
        );
    }

    /// The closest contact that has not been queried yet
    pub fn next_candidate(&mut self) -> Option<Contact> {
        self.entries
            .iter_mut()
            .find(|e| e.state == EntryState::Unqueried)
            .map(|e| {
                e.state = EntryState::Pending;
                e.contact.clone()
            })
    }

    /// Mark a contact as having responded
    pub fn mark_responded(&mut self, id: &NodeId) {
        self.set_state(id, EntryState::Responded);
    }

    /// Mark a contact as unresponsive
    pub fn mark_failed(&mut self, id: &NodeId) {
        self.set_state(id, EntryState::Failed);
    }

    /// Remember the announce token a contact sent with its peers
    pub fn record_token(&mut self, id: NodeId, token: Vec<u8>) {
        self.tokens.insert(id, token);
    }

    /// Tokens collected so far, by contact id
    pub fn tokens(&self) -> &HashMap<NodeId, Vec<u8>> {
        &self.tokens
    }

    /// The crawl is done when the k closest live contacts have all
    /// responded.
    ///
    /// Failed contacts do not count toward the k closest, so a flood of
    /// unresponsive or self-promoting contacts cannot end the crawl early.
    pub fn finished(&self) -> bool {
        let mut live = self
            .entries
            .iter()
            .filter(|e| e.state != EntryState::Failed)
            .take(K);
        let mut any = false;
        for entry in &mut live {
            any = true;
            if entry.state != EntryState::Responded {
                return false;
            }
        }
        // An empty shortlist has nothing left to ask
        any || self.entries.iter().all(|e| e.state == EntryState::Failed)
    }

    fn set_state(&mut self, id: &NodeId, state: EntryState) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.contact.id == *id) {
            entry.state = state;
        }
    }
}

/// Crawl toward `info_hash`, streaming every discovered peer endpoint into
/// `sink` the moment it arrives.
///
/// The crawl ends when the k closest contacts have all answered, when the
/// sink is closed (the caller found a winner), or when the shortlist is
/// exhausted.
pub async fn get_peers_crawl(
    node: Arc<DhtNode>,
    info_hash: [u8; 20],
    sink: mpsc::Sender<SocketAddr>,
) {
    let target = NodeId::new(info_hash);
    let seeds = node.closest_contacts(&target, K).await;
    if seeds.is_empty() {
        warn!("No known contacts to start a get_peers lookup");
        return;
    }
    debug!(
        "Starting get_peers crawl for {} with {} seeds",
        hex::encode(info_hash),
        seeds.len()
    );

    let mut shortlist = Shortlist::new(target, seeds);
    let mut in_flight: JoinSet<(Contact, anyhow::Result<Dict>)> = JoinSet::new();

    loop {
        while in_flight.len() < ALPHA && !shortlist.finished() {
            let Some(contact) = shortlist.next_candidate() else {
                break;
            };
            trace!("Querying {} for peers", contact.addr);
            let node = Arc::clone(&node);
            in_flight.spawn(async move {
                let result = node.get_peers_query(contact.addr, info_hash).await;
                (contact, result)
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let Ok((contact, result)) = joined else {
            continue;
        };

        match result {
            Ok(body) => {
                shortlist.mark_responded(&contact.id);
                if let Some(token) = dict_bytes(&body, b"token") {
                    shortlist.record_token(contact.id, token.to_vec());
                }
                if emit_values(&body, &sink).await.is_err() {
                    // Receiver dropped: the resolver no longer wants peers
                    debug!("Peer sink closed, abandoning crawl");
                    return;
                }
                if let Some(nodes) = dict_bytes(&body, b"nodes") {
                    match parse_compact_nodes(nodes) {
                        Ok(parsed) => {
                            for (id, addr) in parsed {
                                shortlist.insert(Contact::new(id, addr));
                            }
                        }
                        Err(e) => debug!("Bad nodes field from {}: {}", contact.addr, e),
                    }
                }
            }
            Err(e) => {
                debug!("Contact {} failed: {}", contact.addr, e);
                shortlist.mark_failed(&contact.id);
                node.forget_contact(&contact.id).await;
            }
        }

        if shortlist.finished() {
            break;
        }
    }

    debug!(
        "get_peers crawl for {} finished ({} tokens collected)",
        hex::encode(info_hash),
        shortlist.tokens().len()
    );
}

/// Crawl toward `target` with `find_node` queries to freshen the routing
/// table; responders are welcomed by the receive loop.
pub async fn find_node_crawl(node: Arc<DhtNode>, target: NodeId) {
    let seeds = node.closest_contacts(&target, K).await;
    if seeds.is_empty() {
        return;
    }

    let mut shortlist = Shortlist::new(target, seeds);
    let mut in_flight: JoinSet<(Contact, anyhow::Result<Dict>)> = JoinSet::new();

    loop {
        while in_flight.len() < ALPHA && !shortlist.finished() {
            let Some(contact) = shortlist.next_candidate() else {
                break;
            };
            let node = Arc::clone(&node);
            in_flight.spawn(async move {
                let result = node.find_node_query(contact.addr, target).await;
                (contact, result)
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let Ok((contact, result)) = joined else {
            continue;
        };

        match result {
            Ok(body) => {
                shortlist.mark_responded(&contact.id);
                if let Some(nodes) = dict_bytes(&body, b"nodes") {
                    if let Ok(parsed) = parse_compact_nodes(nodes) {
                        for (id, addr) in parsed {
                            shortlist.insert(Contact::new(id, addr));
                        }
                    }
                }
            }
            Err(_) => {
                shortlist.mark_failed(&contact.id);
                node.forget_contact(&contact.id).await;
            }
        }

        if shortlist.finished() {
            break;
        }
    }
}

/// Push the compact peers in a `values` list to the sink, dropping
/// zero-port entries. Errors when the sink is closed.
async fn emit_values(
    body: &Dict,
    sink: &mpsc::Sender<SocketAddr>,
) -> Result<(), mpsc::error::SendError<SocketAddr>> {
    let Some(Value::List(values)) = body.get(b"values".as_ref()) else {
        return Ok(());
    };
    for value in values {
        let Value::Bytes(compact) = value else {
            continue;
        };
        let Some(peer) = parse_compact_peer(compact) else {
            continue;
        };
        if peer.port() == 0 {
            continue;
        }
        trace!("DHT crawl found peer {}", peer);
        sink.send(peer).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact_at(distance_byte: u8, port: u16) -> Contact {
        let mut id = [0u8; 20];
        id[0] = distance_byte;
        Contact::new(NodeId::new(id), format!("127.0.0.1:{}", port).parse().unwrap())
    }

    #[test]
    fn test_candidates_come_out_closest_first() {
        let target = NodeId::new([0u8; 20]);
        let mut shortlist = Shortlist::new(
            target,
            vec![contact_at(0x80, 1), contact_at(0x01, 2), contact_at(0x40, 3)],
        );

        assert_eq!(shortlist.next_candidate().unwrap().id.0[0], 0x01);
        assert_eq!(shortlist.next_candidate().unwrap().id.0[0], 0x40);
        assert_eq!(shortlist.next_candidate().unwrap().id.0[0], 0x80);
        assert!(shortlist.next_candidate().is_none());
    }

    #[test]
    fn test_duplicate_insert_keeps_state() {
        let target = NodeId::new([0u8; 20]);
        let mut shortlist = Shortlist::new(target, vec![contact_at(0x01, 1)]);

        let candidate = shortlist.next_candidate().unwrap();
        // The same contact coming back in a nodes list must not reset its
        // pending state
        shortlist.insert(contact_at(0x01, 1));
        assert!(shortlist.next_candidate().is_none());
        shortlist.mark_responded(&candidate.id);
        assert!(shortlist.finished());
    }

    #[test]
    fn test_finished_requires_k_closest_responded() {
        let target = NodeId::new([0u8; 20]);
        let mut shortlist = Shortlist::new(target, vec![contact_at(0x01, 1), contact_at(0x02, 2)]);

        let first = shortlist.next_candidate().unwrap();
        shortlist.mark_responded(&first.id);
        assert!(!shortlist.finished());

        let second = shortlist.next_candidate().unwrap();
        shortlist.mark_responded(&second.id);
        assert!(shortlist.finished());
    }

    #[test]
    fn test_failed_contacts_do_not_satisfy_finish() {
        let target = NodeId::new([0u8; 20]);
        let mut shortlist = Shortlist::new(target, vec![contact_at(0x01, 1), contact_at(0x02, 2)]);

        let first = shortlist.next_candidate().unwrap();
        let second = shortlist.next_candidate().unwrap();
        shortlist.mark_failed(&first.id);
        assert!(!shortlist.finished());
        shortlist.mark_responded(&second.id);
        assert!(shortlist.finished());
    }

    #[test]
    fn test_all_failed_terminates() {
        let target = NodeId::new([0u8; 20]);
        let mut shortlist = Shortlist::new(target, vec![contact_at(0x01, 1)]);
        let only = shortlist.next_candidate().unwrap();
        shortlist.mark_failed(&only.id);
        assert!(shortlist.finished());
    }

    #[test]
    fn test_tokens_recorded_per_contact() {
        let target = NodeId::new([0u8; 20]);
        let mut shortlist = Shortlist::new(target, vec![contact_at(0x01, 1)]);
        let contact = shortlist.next_candidate().unwrap();
        shortlist.record_token(contact.id, b"opaque".to_vec());
        assert_eq!(shortlist.tokens().get(&contact.id).unwrap(), b"opaque");
    }

    #[tokio::test]
    async fn test_emit_values_filters_zero_ports() {
        let mut body = Dict::new();
        body.insert(
            b"values".to_vec(),
            Value::List(vec![
                Value::Bytes(vec![127, 0, 0, 1, 0x1a, 0xe1]),
                Value::Bytes(vec![127, 0, 0, 2, 0, 0]),
                Value::Bytes(vec![1, 2, 3]), // malformed, skipped
            ]),
        );

        let (tx, mut rx) = mpsc::channel(8);
        emit_values(&body, &tx).await.unwrap();
        drop(tx);

        let mut received = Vec::new();
        while let Some(peer) = rx.recv().await {
            received.push(peer);
        }
        assert_eq!(received, vec!["127.0.0.1:6881".parse().unwrap()]);
    }
}
