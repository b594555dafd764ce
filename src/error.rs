//! Error types for the magnet resolver
//!
//! This module defines error types for all components of the resolver.
//! Recoverable failures (a tracker that times out, a peer that lies) are
//! absorbed by their source; only malformed input and total exhaustion
//! reach the caller.

use std::fmt;

/// Comprehensive error type for magnet resolution
#[derive(Debug, Clone)]
pub enum FetchError {
    /// Magnet URI parsing errors (fatal)
    MagnetError {
        message: String,
    },

    /// Tracker announce errors (recoverable per source)
    TrackerError {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// Peer session errors (recoverable per session)
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// BitTorrent wire protocol violations
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// DHT errors
    DhtError {
        message: String,
        node: Option<String>,
        source: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Cache and state-file I/O errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// No source produced valid metadata (fatal for the request)
    FailedToFetch,
}

impl FetchError {
    /// Create a new MagnetError
    pub fn magnet_error(message: impl Into<String>) -> Self {
        FetchError::MagnetError {
            message: message.into(),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        FetchError::TrackerError {
            message: message.into(),
            tracker: None,
            source: None,
        }
    }

    /// Create a new TrackerError with tracker URL
    pub fn tracker_error_with_url(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        FetchError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with tracker URL and source
    pub fn tracker_error_full(
        message: impl Into<String>,
        tracker: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        FetchError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        FetchError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        FetchError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(
        message: impl Into<String>,
        peer: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        FetchError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        FetchError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        FetchError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new DhtError
    pub fn dht_error(message: impl Into<String>) -> Self {
        FetchError::DhtError {
            message: message.into(),
            node: None,
            source: None,
        }
    }

    /// Create a new DhtError with node
    pub fn dht_error_with_node(message: impl Into<String>, node: impl Into<String>) -> Self {
        FetchError::DhtError {
            message: message.into(),
            node: Some(node.into()),
            source: None,
        }
    }

    /// Create a new DhtError with node and source
    pub fn dht_error_full(
        message: impl Into<String>,
        node: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        FetchError::DhtError {
            message: message.into(),
            node: Some(node.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        FetchError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        FetchError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(
        message: impl Into<String>,
        address: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        FetchError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        FetchError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        FetchError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        FetchError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new FailedToFetch error
    pub fn failed_to_fetch() -> Self {
        FetchError::FailedToFetch
    }

    /// Whether this error terminates the whole request.
    ///
    /// Everything else is absorbed by the source it came from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::MagnetError { .. } | FetchError::FailedToFetch
        )
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::MagnetError { message } => {
                write!(f, "Magnet error: {}", message)
            }
            FetchError::TrackerError { message, tracker, source } => {
                match (tracker, source) {
                    (Some(t), Some(s)) => write!(f, "Tracker error: {} (tracker: {}, source: {})", message, t, s),
                    (Some(t), None) => write!(f, "Tracker error: {} (tracker: {})", message, t),
                    (None, Some(s)) => write!(f, "Tracker error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Tracker error: {}", message),
                }
            }
            FetchError::PeerError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Peer error: {}", message),
                }
            }
            FetchError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            FetchError::DhtError { message, node, source } => {
                match (node, source) {
                    (Some(n), Some(s)) => write!(f, "DHT error: {} (node: {}, source: {})", message, n, s),
                    (Some(n), None) => write!(f, "DHT error: {} (node: {})", message, n),
                    (None, Some(s)) => write!(f, "DHT error: {} (source: {})", message, s),
                    (None, None) => write!(f, "DHT error: {}", message),
                }
            }
            FetchError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            FetchError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            FetchError::FailedToFetch => {
                write!(f, "Failed to fetch metadata from any source")
            }
        }
    }
}

impl std::error::Error for FetchError {}

// Implement From traits for common error types

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

// Note: serde_bencode::Error is the public type, not de::Error or ser::Error
impl From<serde_bencode::Error> for FetchError {
    fn from(err: serde_bencode::Error) -> Self {
        FetchError::protocol_error_with_source("Failed to decode bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::storage_error_full("Failed to parse JSON data", "unknown".to_string(), err.to_string())
    }
}

impl From<std::net::AddrParseError> for FetchError {
    fn from(err: std::net::AddrParseError) -> Self {
        FetchError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FetchError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        FetchError::network_error("Operation timed out")
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let tracker = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        FetchError::tracker_error_full("HTTP request failed", tracker, err.to_string())
    }
}
