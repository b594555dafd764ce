//! BitTorrent protocol module
//!
//! Peer-wire plumbing: handshake, length-prefixed framing, and the
//! extension messages used for metadata exchange.

pub mod extension;
pub mod handshake;
pub mod wire;

// Re-export main types
pub use extension::{
    build_extension_handshake, build_metadata_request, parse_extension_handshake,
    parse_metadata_message, split_bencoded_dict, ExtensionHandshake, MetadataMessage,
    EXTENSION_HANDSHAKE_ID, EXTENSION_MESSAGE_ID, MAX_METADATA_SIZE, METADATA_PIECE_SIZE,
    UT_METADATA_LOCAL_ID,
};
pub use handshake::{Handshake, HANDSHAKE_LENGTH, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use wire::{read_frame, read_handshake, write_frame, write_handshake, MAX_MESSAGE_SIZE};
