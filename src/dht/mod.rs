//! DHT (Distributed Hash Table) module
//!
//! Kademlia node for BitTorrent peer discovery (BEP 5).

pub mod dht;
pub mod krpc;
pub mod lookup;
pub mod node;
pub mod routing;
pub mod storage;

// Re-exports for convenience
pub use dht::{DhtNode, DEFAULT_BOOTSTRAP_NODES};
pub use krpc::{
    generate_transaction_id, parse_compact_nodes, parse_compact_peer, serialize_compact_nodes,
    serialize_compact_peer, KrpcMessage, QueryMethod,
};
pub use node::{Contact, NodeId};
pub use routing::{AddOutcome, KBucket, RoutingTable, K};
pub use storage::{PeerStore, TokenStore};
