//! Magnet link parser
//!
//! Handles parsing of magnet:// URIs to extract the info hash, display
//! name and tracker hints.

use anyhow::Result;
use data_encoding::BASE32;
use tracing::{debug, warn};
use url::Url;

use crate::error::FetchError;

/// Parsed magnet link information
#[derive(Debug, Clone)]
pub struct MagnetInfo {
    /// SHA1 info hash from the magnet link
    pub info_hash: [u8; 20],
    /// Display name (dn parameter)
    pub display_name: Option<String>,
    /// Tracker URLs (tr parameters)
    pub trackers: Vec<String>,
}

impl MagnetInfo {
    /// The info hash as a lowercase hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Parser for magnet links
pub struct MagnetParser;

impl MagnetParser {
    /// Parse a magnet link string
    ///
    /// # Example
    /// ```ignore
    /// let magnet = "magnet:?xt=urn:btih:e2467cbf021192c241367b892230dc1e05c0580e&dn=ubuntu";
    /// let info = MagnetParser::parse(magnet)?;
    /// ```
    pub fn parse(magnet_uri: &str) -> Result<MagnetInfo> {
        debug!("Parsing magnet link: {}", magnet_uri);

        let url = Url::parse(magnet_uri.trim()).map_err(|e| {
            warn!("Invalid magnet URL format: {}", e);
            FetchError::magnet_error(format!("Invalid magnet URL format: {}", e))
        })?;

        if url.scheme() != "magnet" {
            warn!("URL is not a magnet link: scheme is '{}'", url.scheme());
            return Err(FetchError::magnet_error("URL is not a magnet link").into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                // Exact topic (xt) - contains the info hash
                "xt" => {
                    if let Some(hash) = Self::extract_info_hash(&value)? {
                        debug!("Extracted info hash: {}", hex::encode(hash));
                        info_hash = Some(hash);
                    }
                }
                // Display name (dn)
                "dn" => {
                    display_name = Some(value.into_owned());
                }
                // Tracker (tr)
                "tr" => {
                    trackers.push(value.into_owned());
                }
                _ => {
                    debug!("Ignoring unknown parameter: {}", key);
                }
            }
        }

        // Info hash is required
        let info_hash = info_hash.ok_or_else(|| {
            warn!("Magnet link missing required info hash (xt parameter)");
            FetchError::magnet_error("Magnet link must contain an info hash (xt=urn:btih:<hash>)")
        })?;

        debug!(
            "Parsed magnet link: info_hash={}, name={}, trackers={}",
            hex::encode(info_hash),
            display_name.as_deref().unwrap_or("(none)"),
            trackers.len()
        );

        Ok(MagnetInfo {
            info_hash,
            display_name,
            trackers,
        })
    }

    /// Extract the info hash from an xt parameter value
    ///
    /// The xt parameter has the format `urn:btih:<hash>` where the hash is
    /// either a 40-character hex string or a 32-character base32 string.
    fn extract_info_hash(xt_value: &str) -> Result<Option<[u8; 20]>> {
        if !xt_value.starts_with("urn:btih:") {
            debug!("xt parameter is not a BitTorrent info hash: {}", xt_value);
            return Ok(None);
        }

        let hash_str = &xt_value[9..];

        let bytes = match hash_str.len() {
            40 => hex::decode(hash_str).map_err(|e| {
                FetchError::magnet_error(format!("Invalid hex info hash: {}", e))
            })?,
            32 => BASE32
                .decode(hash_str.to_ascii_uppercase().as_bytes())
                .map_err(|e| {
                    FetchError::magnet_error(format!("Invalid base32 info hash: {}", e))
                })?,
            other => {
                return Err(FetchError::magnet_error(format!(
                    "Info hash has invalid length: {} (expected 40 for hex or 32 for base32)",
                    other
                ))
                .into());
            }
        };

        if bytes.len() != 20 {
            return Err(FetchError::magnet_error(format!(
                "Info hash decoded to {} bytes, expected 20",
                bytes.len()
            ))
            .into());
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        Ok(Some(hash))
    }

    /// Check if a string looks like a magnet link
    pub fn is_magnet_link(input: &str) -> bool {
        input.trim().starts_with("magnet:?") || input.trim().starts_with("magnet://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UBUNTU_MAGNET: &str = "magnet:?xt=urn:btih:e2467cbf021192c241367b892230dc1e05c0580e&dn=ubuntu-19.10-desktop-amd64.iso&tr=https%3A%2F%2Ftorrent.ubuntu.com%2Fannounce";

    #[test]
    fn test_parse_ubuntu_magnet() {
        let info = MagnetParser::parse(UBUNTU_MAGNET).unwrap();

        assert_eq!(
            hex::encode(info.info_hash),
            "e2467cbf021192c241367b892230dc1e05c0580e"
        );
        assert_eq!(
            info.display_name,
            Some("ubuntu-19.10-desktop-amd64.iso".to_string())
        );
        assert_eq!(
            info.trackers,
            vec!["https://torrent.ubuntu.com/announce".to_string()]
        );
    }

    #[test]
    fn test_parse_simple_magnet() {
        let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";
        let info = MagnetParser::parse(magnet).unwrap();

        assert_eq!(
            hex::encode(info.info_hash),
            "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c"
        );
        assert!(info.display_name.is_none());
        assert!(info.trackers.is_empty());
    }

    #[test]
    fn test_parse_base32_magnet() {
        // base32 of 20 zero bytes
        let magnet = "magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let info = MagnetParser::parse(magnet).unwrap();
        assert_eq!(info.info_hash, [0u8; 20]);
    }

    #[test]
    fn test_parse_base32_lowercase() {
        let magnet = "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let info = MagnetParser::parse(magnet).unwrap();
        assert_eq!(info.info_hash, [0u8; 20]);
    }

    #[test]
    fn test_parse_magnet_with_trackers() {
        let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&tr=http://tracker1.com&tr=udp://tracker2.com:6969";
        let info = MagnetParser::parse(magnet).unwrap();

        assert_eq!(info.trackers.len(), 2);
        assert!(info.trackers.contains(&"http://tracker1.com".to_string()));
        assert!(info.trackers.contains(&"udp://tracker2.com:6969".to_string()));
    }

    #[test]
    fn test_parse_invalid_magnet_no_info_hash() {
        let magnet = "magnet:?dn=Test+Torrent&tr=http://tracker.com";
        assert!(MagnetParser::parse(magnet).is_err());
    }

    #[test]
    fn test_parse_invalid_url() {
        assert!(MagnetParser::parse("not-a-magnet-link").is_err());
    }

    #[test]
    fn test_parse_invalid_scheme() {
        let magnet = "http:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";
        assert!(MagnetParser::parse(magnet).is_err());
    }

    #[test]
    fn test_parse_wrong_length_hash() {
        let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d";
        assert!(MagnetParser::parse(magnet).is_err());
    }

    #[test]
    fn test_extract_info_hash_non_bittorrent() {
        let xt = "urn:sha1:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";
        assert!(MagnetParser::extract_info_hash(xt).unwrap().is_none());
    }

    #[test]
    fn test_is_magnet_link() {
        assert!(MagnetParser::is_magnet_link("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c"));
        assert!(MagnetParser::is_magnet_link("  magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c  "));
        assert!(!MagnetParser::is_magnet_link("http://example.com"));
        assert!(!MagnetParser::is_magnet_link("example.torrent"));
    }

    #[test]
    fn test_info_hash_hex() {
        let info = MagnetParser::parse(UBUNTU_MAGNET).unwrap();
        assert_eq!(info.info_hash_hex(), "e2467cbf021192c241367b892230dc1e05c0580e");
    }
}
