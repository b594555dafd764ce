//! BitTorrent handshake protocol
//!
//! Handles the initial 68-byte handshake between peers, including the
//! extension-protocol reserved bit the metadata exchange depends on.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use crate::error::FetchError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake length in bytes
pub const HANDSHAKE_LENGTH: usize = 68;

/// Extension protocol bit (BEP 10): bit 0x10 of reserved byte 5
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// BitTorrent handshake message
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Protocol identifier (19 bytes)
    pub protocol_id: [u8; 19],
    /// Reserved bytes carrying capability bits
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a handshake advertising extension-protocol support
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            protocol_id: PROTOCOL_STRING.as_bytes().try_into().expect("19 bytes"),
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with an Azureus-style prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-MT0100-");
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        peer_id
    }

    /// Whether the handshake advertises the extension protocol
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Serialize the handshake to its 68-byte wire form
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(&self.protocol_id);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LENGTH {
            return Err(FetchError::protocol_error_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len()),
            )
            .into());
        }

        let protocol_length = data[0];
        if protocol_length != PROTOCOL_LENGTH {
            return Err(FetchError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, protocol_length),
            )
            .into());
        }

        let protocol_id: [u8; 19] = data[1..20].try_into().expect("19 bytes");
        if protocol_id != PROTOCOL_STRING.as_bytes() {
            return Err(FetchError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Deserialized handshake: info_hash={}, extensions={}",
            hex::encode(info_hash),
            reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
        );

        Ok(Self {
            protocol_id,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validate a peer's handshake against the info hash we asked for.
    ///
    /// A peer that echoes a different info hash, or does not speak the
    /// extension protocol, is useless for metadata exchange.
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return Err(FetchError::protocol_error("Handshake info hash mismatch").into());
        }

        if !self.supports_extensions() {
            return Err(FetchError::protocol_error("Peer does not support the extension protocol").into());
        }

        Ok(())
    }
}
