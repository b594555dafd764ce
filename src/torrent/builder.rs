//! Torrent file assembly
//!
//! Wraps a verified raw `info` dictionary into a complete `.torrent` file
//! and derives a safe output filename.
//!
//! The `info` blob is spliced into the output byte-for-byte rather than
//! decoded and re-encoded, so the SHA-1 of the embedded dictionary always
//! equals the info hash the metadata was verified against.

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::debug;

use crate::error::FetchError;
use crate::torrent::magnet::MagnetInfo;

/// Builds `.torrent` files around a raw `info` dictionary
#[derive(Debug, Clone, Default)]
pub struct TorrentBuilder {
    /// Tracker URLs for the announce / announce-list fields
    pub trackers: Vec<String>,
}

impl TorrentBuilder {
    /// Create a builder with the given tracker list
    pub fn new(trackers: Vec<String>) -> Self {
        Self { trackers }
    }

    /// Assemble the torrent file bytes.
    ///
    /// Top-level keys are emitted in sorted order (announce, announce-list,
    /// info) as bencode requires.
    pub fn build(&self, raw_info: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(raw_info.len() + 256);
        out.push(b'd');

        if !self.trackers.is_empty() {
            let announce = Value::Bytes(self.trackers[0].as_bytes().to_vec());
            out.extend_from_slice(b"8:announce");
            out.extend_from_slice(&serde_bencode::to_bytes(&announce).map_err(FetchError::from)?);

            // announce-list is a list of tiers, one tracker per tier
            let tiers: Vec<Value> = self
                .trackers
                .iter()
                .map(|t| Value::List(vec![Value::Bytes(t.as_bytes().to_vec())]))
                .collect();
            out.extend_from_slice(b"13:announce-list");
            out.extend_from_slice(
                &serde_bencode::to_bytes(&Value::List(tiers)).map_err(FetchError::from)?,
            );
        }

        out.extend_from_slice(b"4:info");
        out.extend_from_slice(raw_info);
        out.push(b'e');

        debug!(
            "Built torrent file: {} bytes ({} trackers)",
            out.len(),
            self.trackers.len()
        );
        Ok(out)
    }
}

/// Derive the output filename for a resolved magnet.
///
/// Prefers the magnet's display name, falls back to the `name` field of the
/// `info` dictionary, and finally to the hex info hash. Always suffixed
/// with `.torrent`.
pub fn torrent_file_name(magnet: &MagnetInfo, raw_info: &[u8]) -> String {
    let name = magnet
        .display_name
        .clone()
        .or_else(|| info_name(raw_info))
        .unwrap_or_else(|| magnet.info_hash_hex());
    format!("{}.torrent", sanitize_name(&name))
}

/// Extract the `name` field from a raw bencoded `info` dictionary
fn info_name(raw_info: &[u8]) -> Option<String> {
    let value: Value = serde_bencode::from_bytes(raw_info).ok()?;
    let Value::Dict(dict) = value else {
        return None;
    };
    match dict.get(b"name".as_ref()) {
        Some(Value::Bytes(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

/// Strip path separators, colons and NULs out of a torrent name
fn sanitize_name(name: &str) -> String {
    name.trim_matches('.')
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '\0'))
        .collect()
}
