//! magnet2torrent
//!
//! Resolves BitTorrent magnet links into fully-formed `.torrent` files by
//! discovering peers (HTTP/UDP trackers, Kademlia DHT) and fetching the
//! torrent metadata from them over the ut_metadata extension.

pub mod cache;
pub mod cli;
pub mod dht;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod torrent;
pub mod tracker;

pub use error::FetchError;

pub use cache::TorrentCache;
pub use cli::{CliArgs, Command, Config};
pub use dht::{Contact, DhtNode, KrpcMessage, NodeId, RoutingTable, DEFAULT_BOOTSTRAP_NODES};
pub use peer::{fetch_metadata, MetadataPieces, PeerWorkerPool};
pub use protocol::{Handshake, MetadataMessage};
pub use resolver::{Magnet2Torrent, DEFAULT_TRACKERS};
pub use server::ServerState;
pub use torrent::{torrent_file_name, MagnetInfo, MagnetParser, TorrentBuilder};
pub use tracker::{HttpTrackerClient, UdpTrackerClient};
