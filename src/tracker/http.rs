//! HTTP tracker client
//!
//! Issues `GET /announce` requests and parses the bencoded peer list,
//! in both compact and dictionary form.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Per-tracker announce timeout
pub const HTTP_TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for HTTP and HTTPS trackers
pub struct HttpTrackerClient {
    client: reqwest::Client,
    peer_id: [u8; 20],
    port: u16,
}

impl HttpTrackerClient {
    /// Create a new client announcing the given peer id and listen port
    pub fn new(peer_id: [u8; 20], port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TRACKER_TIMEOUT)
            .build()
            .map_err(FetchError::from)?;
        Ok(Self { client, peer_id, port })
    }

    /// Announce to a tracker and return the peer endpoints it knows about.
    ///
    /// Tracker-reported failures yield an empty list; transport and HTTP
    /// status failures yield a recoverable error.
    pub async fn announce(&self, tracker: &str, info_hash: [u8; 20]) -> Result<Vec<SocketAddr>> {
        let sep = if tracker.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left=16384&compact=1&event=started&no_peer_id=1&numwant=200",
            tracker,
            sep,
            urlencode_bytes(&info_hash),
            urlencode_bytes(&self.peer_id),
            self.port,
        );
        debug!("Announcing to HTTP tracker: {}", tracker);

        let response = self.client.get(&url).send().await.map_err(FetchError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::tracker_error_full(
                "Tracker returned non-success status",
                tracker,
                status.to_string(),
            )
            .into());
        }

        let body = response.bytes().await.map_err(FetchError::from)?;
        let peers = parse_announce_response(&body).map_err(|e| {
            FetchError::tracker_error_full("Failed to parse announce response", tracker, e.to_string())
        })?;

        debug!("HTTP tracker {} returned {} peers", tracker, peers.len());
        Ok(peers)
    }
}

/// Parse a bencoded announce response into peer endpoints.
///
/// A `failure reason` key or a malformed `peers` value yields an empty
/// list; only an undecodable body is an error.
pub fn parse_announce_response(body: &[u8]) -> Result<Vec<SocketAddr>> {
    let value: Value = serde_bencode::from_bytes(body).map_err(FetchError::from)?;
    let Value::Dict(dict) = value else {
        return Err(FetchError::tracker_error("Announce response is not a dictionary").into());
    };

    if let Some(Value::Bytes(reason)) = dict.get(b"failure reason".as_ref()) {
        warn!("Tracker reported failure: {}", String::from_utf8_lossy(reason));
        return Ok(Vec::new());
    }

    match dict.get(b"peers".as_ref()) {
        Some(Value::Bytes(data)) => Ok(parse_compact_peer_list(data)),
        Some(Value::List(entries)) => Ok(parse_dict_peer_list(entries)),
        _ => {
            warn!("Announce response has no usable peers field");
            Ok(Vec::new())
        }
    }
}

/// Parse the compact peer form: consecutive 6-byte IPv4+port entries
fn parse_compact_peer_list(data: &[u8]) -> Vec<SocketAddr> {
    if data.len() % 6 != 0 {
        warn!("Compact peer string has invalid length {}", data.len());
        return Vec::new();
    }

    data.chunks_exact(6)
        .filter_map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            if port == 0 {
                return None;
            }
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        })
        .collect()
}

/// Parse the dictionary peer form: a list of dicts with `ip` and `port`
fn parse_dict_peer_list(entries: &[Value]) -> Vec<SocketAddr> {
    entries
        .iter()
        .filter_map(|entry| {
            let Value::Dict(peer) = entry else {
                return None;
            };
            let Some(Value::Bytes(ip_bytes)) = peer.get(b"ip".as_ref()) else {
                return None;
            };
            let Some(Value::Int(port)) = peer.get(b"port".as_ref()) else {
                return None;
            };
            let ip: IpAddr = String::from_utf8_lossy(ip_bytes).parse().ok()?;
            let port = u16::try_from(*port).ok()?;
            if port == 0 {
                return None;
            }
            Some(SocketAddr::new(ip, port))
        })
        .collect()
}

/// Percent-encode raw bytes for a tracker query parameter.
///
/// `info_hash` and `peer_id` are arbitrary 20-byte binary; every byte
/// outside the unreserved set is escaped.
pub fn urlencode_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for &byte in data {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_response() {
        // d5:peers6:<127.0.0.1:6881>e
        let mut body = b"d5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.push(b'e');

        let peers = parse_announce_response(&body).unwrap();
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_failure_reason() {
        let body = b"d14:failure reason4:nopee";
        let peers = parse_announce_response(body).unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn test_parse_dict_peer_form() {
        let body = b"d5:peersld2:ip9:127.0.0.14:porti6881eed2:ip7:8.8.8.84:porti80eeee";
        let peers = parse_announce_response(body).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "8.8.8.8:80".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_parse_drops_zero_ports() {
        let mut body = b"d5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0, 0]);
        body.extend_from_slice(&[127, 0, 0, 2, 0x1a, 0xe1]);
        body.push(b'e');

        let peers = parse_announce_response(&body).unwrap();
        assert_eq!(peers, vec!["127.0.0.2:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_malformed_peers_tolerated() {
        // peers length not a multiple of 6
        let mut body = b"d5:peers4:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1]);
        body.push(b'e');

        let peers = parse_announce_response(&body).unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn test_parse_missing_peers_tolerated() {
        let body = b"d8:intervali1800ee";
        let peers = parse_announce_response(body).unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn test_parse_undecodable_body_is_error() {
        assert!(parse_announce_response(b"not bencode").is_err());
    }

    #[test]
    fn test_urlencode_bytes() {
        assert_eq!(urlencode_bytes(b"abc-._~09"), "abc-._~09");
        assert_eq!(urlencode_bytes(&[0x00, 0xff, b' ']), "%00%FF%20");
        let hash = hex::decode("e2467cbf021192c241367b892230dc1e05c0580e").unwrap();
        assert_eq!(
            urlencode_bytes(&hash),
            "%E2F%7C%BF%02%11%92%C2A6%7B%89%220%DC%1E%05%C0X%0E"
        );
    }
}
