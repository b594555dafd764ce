//! UDP tracker client
//!
//! Implements the BEP 15 two-step handshake (connect, then announce) over
//! a dedicated socket per tracker, with the protocol's exponential retry
//! schedule.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::error::FetchError;

/// Magic constant opening every connect request
pub const UDP_PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const EVENT_STARTED: u32 = 2;

const CONNECT_RESPONSE_LEN: usize = 16;
/// Announce replies below this length are malformed and must never
/// produce peers.
const ANNOUNCE_RESPONSE_MIN_LEN: usize = 20;

/// Number of send attempts before giving up (n in [0, 3])
const RETRY_ATTEMPTS: u32 = 4;

/// Client for BEP 15 UDP trackers
pub struct UdpTrackerClient {
    peer_id: [u8; 20],
    port: u16,
    /// Base of the 15 * 2^n retry schedule; shrunk in tests
    retry_base: Duration,
}

impl UdpTrackerClient {
    /// Create a new client announcing the given peer id and listen port
    pub fn new(peer_id: [u8; 20], port: u16) -> Self {
        Self {
            peer_id,
            port,
            retry_base: Duration::from_secs(15),
        }
    }

    /// Override the retry base (test hook)
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// Announce to a `udp://host:port[/...]` tracker and return the peer
    /// endpoints it knows about.
    pub async fn announce(&self, tracker: &str, info_hash: [u8; 20]) -> Result<Vec<SocketAddr>> {
        let addr = resolve_tracker(tracker).await?;
        debug!("Announcing to UDP tracker {} ({})", tracker, addr);

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
            FetchError::network_error_full("Failed to bind UDP socket", "0.0.0.0:0", e.to_string())
        })?;
        socket.connect(addr).await.map_err(|e| {
            FetchError::network_error_full("Failed to connect UDP socket", addr.to_string(), e.to_string())
        })?;

        // connection_id is valid for a minute, long enough for the
        // announce that immediately follows
        let connection_id = self.connect_phase(&socket, tracker).await?;
        let peers = self
            .announce_phase(&socket, tracker, connection_id, info_hash)
            .await?;

        debug!("UDP tracker {} returned {} peers", tracker, peers.len());
        Ok(peers)
    }

    /// Step 1: obtain a connection id
    async fn connect_phase(&self, socket: &UdpSocket, tracker: &str) -> Result<u64> {
        for attempt in 0..RETRY_ATTEMPTS {
            let transaction_id: u32 = rand::thread_rng().gen();
            let request = build_connect_request(transaction_id);
            socket.send(&request).await.map_err(|e| {
                FetchError::tracker_error_full("Failed to send connect request", tracker, e.to_string())
            })?;

            let deadline = Instant::now() + self.retry_timeout(attempt);
            let mut buf = [0u8; 512];
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let len = match timeout(remaining, socket.recv(&mut buf)).await {
                    Ok(Ok(len)) => len,
                    Ok(Err(e)) => {
                        return Err(FetchError::tracker_error_full(
                            "UDP receive failed",
                            tracker,
                            e.to_string(),
                        )
                        .into());
                    }
                    Err(_) => break,
                };

                match parse_connect_response(&buf[..len], transaction_id) {
                    Ok(connection_id) => return Ok(connection_id),
                    Err(e) => {
                        warn!("Ignoring bad connect response from {}: {}", tracker, e);
                    }
                }
            }
        }

        Err(FetchError::tracker_error_with_url("Connect timed out", tracker).into())
    }

    /// Step 2: announce and collect peers
    async fn announce_phase(
        &self,
        socket: &UdpSocket,
        tracker: &str,
        connection_id: u64,
        info_hash: [u8; 20],
    ) -> Result<Vec<SocketAddr>> {
        for attempt in 0..RETRY_ATTEMPTS {
            let transaction_id: u32 = rand::thread_rng().gen();
            let request = build_announce_request(
                connection_id,
                transaction_id,
                info_hash,
                self.peer_id,
                self.port,
            );
            socket.send(&request).await.map_err(|e| {
                FetchError::tracker_error_full("Failed to send announce request", tracker, e.to_string())
            })?;

            let deadline = Instant::now() + self.retry_timeout(attempt);
            let mut buf = [0u8; 4096];
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let len = match timeout(remaining, socket.recv(&mut buf)).await {
                    Ok(Ok(len)) => len,
                    Ok(Err(e)) => {
                        return Err(FetchError::tracker_error_full(
                            "UDP receive failed",
                            tracker,
                            e.to_string(),
                        )
                        .into());
                    }
                    Err(_) => break,
                };

                match parse_announce_response(&buf[..len], transaction_id) {
                    Ok(peers) => return Ok(peers),
                    Err(e) => {
                        // A tracker-reported error ends the exchange; a
                        // malformed reply just keeps us waiting
                        if let Some(FetchError::TrackerError { .. }) =
                            e.downcast_ref::<FetchError>()
                        {
                            return Err(e);
                        }
                        warn!("Ignoring bad announce response from {}: {}", tracker, e);
                    }
                }
            }
        }

        Err(FetchError::tracker_error_with_url("Announce timed out", tracker).into())
    }

    fn retry_timeout(&self, attempt: u32) -> Duration {
        self.retry_base * 2u32.pow(attempt)
    }
}

/// Resolve a `udp://host:port` tracker URL to a socket address.
///
/// The URL path and query are ignored; IPv4 addresses are preferred.
pub async fn resolve_tracker(tracker: &str) -> Result<SocketAddr> {
    let url = Url::parse(tracker).map_err(|e| {
        FetchError::tracker_error_full("Invalid tracker URL", tracker, e.to_string())
    })?;
    if url.scheme() != "udp" {
        return Err(FetchError::tracker_error_full(
            "Not a UDP tracker URL",
            tracker,
            url.scheme().to_string(),
        )
        .into());
    }
    let host = url.host_str().ok_or_else(|| {
        FetchError::tracker_error_with_url("Tracker URL has no host", tracker)
    })?;
    let port = url.port().ok_or_else(|| {
        FetchError::tracker_error_with_url("Tracker URL has no port", tracker)
    })?;

    let mut addrs = lookup_host((host, port)).await.map_err(|e| {
        FetchError::tracker_error_full("Failed to resolve tracker host", tracker, e.to_string())
    })?;
    addrs
        .find(|a| a.is_ipv4())
        .ok_or_else(|| {
            FetchError::tracker_error_with_url("Tracker host has no IPv4 address", tracker).into()
        })
}

/// Build the 16-byte connect request
fn build_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(UDP_PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf.to_vec()
}

/// Build the 98-byte announce request
fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&info_hash);
    buf.put_slice(&peer_id);
    buf.put_i64(0); // downloaded
    buf.put_i64(16384); // left: one metadata piece
    buf.put_i64(0); // uploaded
    buf.put_u32(EVENT_STARTED);
    buf.put_u32(0); // ip: let the tracker use the source address
    buf.put_u32(rand::thread_rng().gen()); // key
    buf.put_i32(-1); // num_want: tracker default
    buf.put_u16(port);
    buf.to_vec()
}

/// Validate a connect response and extract the connection id
fn parse_connect_response(data: &[u8], transaction_id: u32) -> Result<u64> {
    if data.len() < CONNECT_RESPONSE_LEN {
        return Err(FetchError::protocol_error(format!(
            "Connect response too short: {} bytes",
            data.len()
        ))
        .into());
    }
    let mut buf = data;
    let action = buf.get_u32();
    let reply_transaction_id = buf.get_u32();
    if reply_transaction_id != transaction_id {
        return Err(FetchError::protocol_error("Transaction id mismatch").into());
    }
    if action != ACTION_CONNECT {
        return Err(FetchError::protocol_error(format!("Unexpected action {}", action)).into());
    }
    Ok(buf.get_u64())
}

/// Validate an announce response and extract the peer list.
///
/// Replies shorter than the 20-byte header are rejected outright.
fn parse_announce_response(data: &[u8], transaction_id: u32) -> Result<Vec<SocketAddr>> {
    if data.len() >= 8 {
        let action = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let reply_transaction_id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if action == ACTION_ERROR && reply_transaction_id == transaction_id {
            let message = String::from_utf8_lossy(&data[8..]).into_owned();
            return Err(FetchError::tracker_error(message).into());
        }
    }

    if data.len() < ANNOUNCE_RESPONSE_MIN_LEN {
        return Err(FetchError::protocol_error(format!(
            "Announce response too short: {} bytes",
            data.len()
        ))
        .into());
    }

    let mut buf = data;
    let action = buf.get_u32();
    let reply_transaction_id = buf.get_u32();
    if reply_transaction_id != transaction_id {
        return Err(FetchError::protocol_error("Transaction id mismatch").into());
    }
    if action != ACTION_ANNOUNCE {
        return Err(FetchError::protocol_error(format!("Unexpected action {}", action)).into());
    }
    let _interval = buf.get_u32();
    let _leechers = buf.get_u32();
    let _seeders = buf.get_u32();

    Ok(parse_peer_entries(buf))
}

/// Parse trailing 6-byte IPv4+port peer entries, dropping zero ports
fn parse_peer_entries(data: &[u8]) -> Vec<SocketAddr> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    /// A minimal in-process BEP 15 tracker for driving the client
    async fn spawn_mock_tracker(peers: Vec<u8>, announce_reply_len: Option<usize>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let connection_id: u64 = 0x1122334455667788;
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let packet = &buf[..len];
                if len == 16 && (&packet[0..8]).get_u64() == UDP_PROTOCOL_ID {
                    let transaction_id = u32::from_be_bytes([packet[12], packet[13], packet[14], packet[15]]);
                    let mut reply = BytesMut::new();
                    reply.put_u32(ACTION_CONNECT);
                    reply.put_u32(transaction_id);
                    reply.put_u64(connection_id);
                    socket.send_to(&reply, from).await.unwrap();
                } else if len == 98 {
                    let transaction_id = u32::from_be_bytes([packet[12], packet[13], packet[14], packet[15]]);
                    let mut reply = BytesMut::new();
                    reply.put_u32(ACTION_ANNOUNCE);
                    reply.put_u32(transaction_id);
                    reply.put_u32(1800); // interval
                    reply.put_u32(1); // leechers
                    reply.put_u32(2); // seeders
                    reply.put_slice(&peers);
                    let reply = match announce_reply_len {
                        Some(n) => reply[..n].to_vec(),
                        None => reply.to_vec(),
                    };
                    socket.send_to(&reply, from).await.unwrap();
                }
            }
        });

        addr
    }

    fn test_client() -> UdpTrackerClient {
        UdpTrackerClient::new([7u8; 20], 6881).with_retry_base(Duration::from_millis(50))
    }

    #[test]
    fn test_connect_request_layout() {
        let request = build_connect_request(0xdeadbeef);
        assert_eq!(request.len(), 16);
        assert_eq!(&request[0..8], &UDP_PROTOCOL_ID.to_be_bytes());
        assert_eq!(&request[8..12], &[0, 0, 0, 0]);
        assert_eq!(&request[12..16], &0xdeadbeefu32.to_be_bytes());
    }

    #[test]
    fn test_announce_request_layout() {
        let request = build_announce_request(42, 7, [1u8; 20], [2u8; 20], 6881);
        assert_eq!(request.len(), 98);
        assert_eq!(&request[0..8], &42u64.to_be_bytes());
        assert_eq!(&request[8..12], &ACTION_ANNOUNCE.to_be_bytes());
        assert_eq!(&request[16..36], &[1u8; 20]);
        assert_eq!(&request[36..56], &[2u8; 20]);
        assert_eq!(&request[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_parse_connect_response_short() {
        assert!(parse_connect_response(&[0u8; 8], 1).is_err());
    }

    #[test]
    fn test_parse_announce_response_rejects_short() {
        // 12 bytes is shorter than the 20-byte header and must never
        // produce peers
        let mut data = BytesMut::new();
        data.put_u32(ACTION_ANNOUNCE);
        data.put_u32(9);
        data.put_u32(1800);
        assert!(parse_announce_response(&data, 9).is_err());
    }

    #[test]
    fn test_parse_announce_response_tracker_error() {
        let mut data = BytesMut::new();
        data.put_u32(ACTION_ERROR);
        data.put_u32(9);
        data.put_slice(b"torrent not registered");
        let err = parse_announce_response(&data, 9).unwrap_err();
        assert!(err.to_string().contains("torrent not registered"));
    }

    #[test]
    fn test_parse_peer_entries_drops_zero_port() {
        let mut data = Vec::new();
        data.extend_from_slice(&[127, 0, 0, 1, 0, 0]);
        data.extend_from_slice(&[127, 0, 0, 2, 0x1a, 0xe1]);
        let peers = parse_peer_entries(&data);
        assert_eq!(peers, vec!["127.0.0.2:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_announce_against_mock_tracker() {
        let mut peers = Vec::new();
        peers.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        peers.extend_from_slice(&[127, 0, 0, 2, 0, 0]); // dropped
        let addr = spawn_mock_tracker(peers, None).await;

        let client = test_client();
        let tracker = format!("udp://{}/announce", addr);
        let peers = client.announce(&tracker, [3u8; 20]).await.unwrap();
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_short_announce_reply_is_failure() {
        // Tracker truncates its announce reply to 12 bytes; the client
        // must fail instead of inventing peers
        let addr = spawn_mock_tracker(Vec::new(), Some(12)).await;

        let client = test_client();
        let tracker = format!("udp://{}/announce", addr);
        assert!(client.announce(&tracker, [3u8; 20]).await.is_err());
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_recoverable_error() {
        let client = test_client();
        let result = client
            .announce("udp://does-not-exist.invalid:6969/announce", [3u8; 20])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resolve_tracker_rejects_http() {
        assert!(resolve_tracker("http://example.com:80/announce").await.is_err());
    }
}
