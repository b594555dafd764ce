//! Extension protocol messages
//!
//! BEP 10 extended messages and the ut_metadata dialect (BEP 9) used to
//! fetch the `info` dictionary from peers.

use std::collections::HashMap;

use anyhow::Result;
use serde_bencode::value::Value;

use crate::error::FetchError;

/// Peer-wire message id carrying extension messages
pub const EXTENSION_MESSAGE_ID: u8 = 20;

/// Extended-message sub-id of the extension handshake
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The id under which we register ut_metadata in our extension handshake
pub const UT_METADATA_LOCAL_ID: u8 = 1;

/// Metadata piece size (BEP 9); only the last piece may be smaller
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Upper bound on an acceptable metadata_size
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

/// The peer's half of the extension handshake
#[derive(Debug, Clone)]
pub struct ExtensionHandshake {
    /// The peer's local id for ut_metadata; used when sending requests
    pub ut_metadata_id: u8,
    /// Total metadata size in bytes, when the peer has the metadata
    pub metadata_size: Option<u64>,
}

/// A ut_metadata message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    /// Request for a piece
    Request { piece: u32 },
    /// A piece of metadata with its trailing raw bytes
    Data {
        piece: u32,
        total_size: Option<u64>,
        data: Vec<u8>,
    },
    /// The peer refuses to serve the piece
    Reject { piece: u32 },
}

/// Build the payload of our extension handshake frame:
/// `(20, 0, bencode({m: {ut_metadata: 1}}))`
pub fn build_extension_handshake() -> Result<Vec<u8>> {
    let mut m = HashMap::new();
    m.insert(b"ut_metadata".to_vec(), Value::Int(UT_METADATA_LOCAL_ID as i64));
    let mut root = HashMap::new();
    root.insert(b"m".to_vec(), Value::Dict(m));

    let mut payload = vec![EXTENSION_MESSAGE_ID, EXTENSION_HANDSHAKE_ID];
    payload.extend_from_slice(&serde_bencode::to_bytes(&Value::Dict(root)).map_err(FetchError::from)?);
    Ok(payload)
}

/// Build the payload of a metadata piece request frame:
/// `(20, <peer's ut_metadata id>, bencode({msg_type: 0, piece}))`
pub fn build_metadata_request(ut_metadata_id: u8, piece: u32) -> Result<Vec<u8>> {
    let mut dict = HashMap::new();
    dict.insert(b"msg_type".to_vec(), Value::Int(MSG_TYPE_REQUEST));
    dict.insert(b"piece".to_vec(), Value::Int(piece as i64));

    let mut payload = vec![EXTENSION_MESSAGE_ID, ut_metadata_id];
    payload.extend_from_slice(&serde_bencode::to_bytes(&Value::Dict(dict)).map_err(FetchError::from)?);
    Ok(payload)
}

/// Parse the bencoded body of a peer's extension handshake.
///
/// The peer must offer ut_metadata; a `metadata_size` outside (0, 16 MiB]
/// is rejected.
pub fn parse_extension_handshake(body: &[u8]) -> Result<ExtensionHandshake> {
    let value: Value = serde_bencode::from_bytes(body).map_err(FetchError::from)?;
    let Value::Dict(root) = value else {
        return Err(FetchError::protocol_error("Extension handshake is not a dictionary").into());
    };

    let Some(Value::Dict(m)) = root.get(b"m".as_ref()) else {
        return Err(FetchError::protocol_error("Extension handshake has no message map").into());
    };
    let ut_metadata_id = match m.get(b"ut_metadata".as_ref()) {
        Some(Value::Int(id)) if (1..=255).contains(id) => *id as u8,
        _ => {
            return Err(FetchError::protocol_error("Peer does not support ut_metadata").into());
        }
    };

    let metadata_size = match root.get(b"metadata_size".as_ref()) {
        Some(Value::Int(size)) => {
            if *size <= 0 || *size as usize > MAX_METADATA_SIZE {
                return Err(FetchError::protocol_error_with_source(
                    "Unacceptable metadata size",
                    size.to_string(),
                )
                .into());
            }
            Some(*size as u64)
        }
        _ => None,
    };

    Ok(ExtensionHandshake {
        ut_metadata_id,
        metadata_size,
    })
}

/// Parse a ut_metadata message body: a bencoded header dict, followed by
/// the raw piece bytes for data messages.
pub fn parse_metadata_message(body: &[u8]) -> Result<MetadataMessage> {
    let (header, trailing) = split_bencoded_dict(body)?;
    let value: Value = serde_bencode::from_bytes(header).map_err(FetchError::from)?;
    let Value::Dict(dict) = value else {
        return Err(FetchError::protocol_error("ut_metadata header is not a dictionary").into());
    };

    let msg_type = match dict.get(b"msg_type".as_ref()) {
        Some(Value::Int(t)) => *t,
        _ => return Err(FetchError::protocol_error("ut_metadata header has no msg_type").into()),
    };
    let piece = match dict.get(b"piece".as_ref()) {
        Some(Value::Int(piece)) if *piece >= 0 => *piece as u32,
        _ => return Err(FetchError::protocol_error("ut_metadata header has no piece").into()),
    };

    match msg_type {
        MSG_TYPE_REQUEST => Ok(MetadataMessage::Request { piece }),
        MSG_TYPE_DATA => {
            let total_size = match dict.get(b"total_size".as_ref()) {
                Some(Value::Int(size)) if *size >= 0 => Some(*size as u64),
                _ => None,
            };
            Ok(MetadataMessage::Data {
                piece,
                total_size,
                data: trailing.to_vec(),
            })
        }
        MSG_TYPE_REJECT => Ok(MetadataMessage::Reject { piece }),
        other => Err(FetchError::protocol_error_with_source(
            "Unknown ut_metadata msg_type",
            other.to_string(),
        )
        .into()),
    }
}

/// Split a buffer into its leading bencoded dictionary and whatever
/// follows it.
///
/// Walks the bencode token structure rather than searching for a
/// terminator substring, so piece payloads containing `ee` cannot confuse
/// the framing.
pub fn split_bencoded_dict(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.first() != Some(&b'd') {
        return Err(FetchError::protocol_error("Payload does not start with a dictionary").into());
    }

    let mut depth = 0usize;
    let mut pos = 0usize;
    while pos < data.len() {
        match data[pos] {
            b'd' | b'l' => {
                depth += 1;
                pos += 1;
            }
            b'e' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    FetchError::protocol_error("Unbalanced bencode structure")
                })?;
                pos += 1;
                if depth == 0 {
                    return Ok(data.split_at(pos));
                }
            }
            b'i' => {
                let end = data[pos..]
                    .iter()
                    .position(|&b| b == b'e')
                    .ok_or_else(|| FetchError::protocol_error("Unterminated integer"))?;
                pos += end + 1;
            }
            b'0'..=b'9' => {
                let colon = data[pos..]
                    .iter()
                    .position(|&b| b == b':')
                    .ok_or_else(|| FetchError::protocol_error("Unterminated string length"))?;
                let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| FetchError::protocol_error("Invalid string length"))?;
                pos += colon + 1 + length;
                if pos > data.len() {
                    return Err(FetchError::protocol_error("Truncated string").into());
                }
            }
            other => {
                return Err(FetchError::protocol_error_with_source(
                    "Invalid bencode token",
                    format!("0x{:02x}", other),
                )
                .into());
            }
        }
    }

    Err(FetchError::protocol_error("Truncated bencode dictionary").into())
}
