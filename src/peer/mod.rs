//! Peer module
//!
//! Metadata-fetch sessions against individual peers and the bounded
//! worker pool that races them.

pub mod pieces;
pub mod pool;
pub mod session;

// Re-export main types
pub use pieces::{MetadataPieces, PieceState};
pub use pool::{PeerWorkerPool, DEFAULT_MAX_WORKERS};
pub use session::{fetch_metadata, CONNECT_TIMEOUT, SESSION_TIMEOUT};
