//! Peer metadata session
//!
//! One attempt to fetch the `info` dictionary from one endpoint:
//! BitTorrent handshake, extension handshake, pipelined ut_metadata piece
//! requests, SHA-1 verification.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::FetchError;
use crate::peer::pieces::MetadataPieces;
use crate::protocol::extension::{
    build_extension_handshake, build_metadata_request, parse_extension_handshake,
    parse_metadata_message, MetadataMessage, EXTENSION_HANDSHAKE_ID, EXTENSION_MESSAGE_ID,
    UT_METADATA_LOCAL_ID,
};
use crate::protocol::handshake::Handshake;
use crate::protocol::wire::{read_frame, read_handshake, write_frame, write_handshake};

/// TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Total time allowed for one session
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer is dropped after this many response gaps
const MAX_RESPONSE_GAPS: u32 = 3;

/// Length of one response gap
const RESPONSE_GAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Outstanding piece requests kept in flight
const PIPELINE_DEPTH: usize = 4;

/// Fetch and verify the raw `info` dictionary from a single peer.
///
/// Any failure (unreachable, protocol violation, reject, hash mismatch)
/// is a recoverable per-session error.
pub async fn fetch_metadata(
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<Vec<u8>> {
    match timeout(SESSION_TIMEOUT, run_session(addr, info_hash, peer_id)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::peer_error_with_peer("Session timed out", addr.to_string()).into()),
    }
}

async fn run_session(addr: SocketAddr, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<Vec<u8>> {
    trace!("Connecting to peer {}", addr);
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| FetchError::peer_error_with_peer("Connect timed out", addr.to_string()))?
        .map_err(|e| FetchError::peer_error_full("Failed to connect", addr.to_string(), e.to_string()))?;

    // BitTorrent handshake; the peer must echo our info hash and speak
    // the extension protocol
    write_handshake(&mut stream, &Handshake::new(info_hash, peer_id)).await?;
    let peer_handshake = read_handshake(&mut stream).await.map_err(|e| {
        FetchError::peer_error_full("Failed to read handshake", addr.to_string(), e.to_string())
    })?;
    peer_handshake.validate(&info_hash)?;
    trace!("{} | handshake complete", addr);

    // Extension handshake
    write_frame(&mut stream, &build_extension_handshake()?).await?;
    let extension = await_extension_handshake(&mut stream, addr).await?;
    let metadata_size = extension.metadata_size.ok_or_else(|| {
        FetchError::peer_error_with_peer("Peer did not report a metadata size", addr.to_string())
    })?;
    debug!("{} | peer reports metadata size {}", addr, metadata_size);

    let mut pieces = MetadataPieces::new(metadata_size as usize)?;

    // Pipeline piece requests
    let mut outstanding = 0usize;
    while outstanding < PIPELINE_DEPTH {
        let Some(index) = pieces.next_to_request() else {
            break;
        };
        write_frame(
            &mut stream,
            &build_metadata_request(extension.ut_metadata_id, index as u32)?,
        )
        .await?;
        outstanding += 1;
    }

    let mut gaps = 0u32;
    while !pieces.is_complete() {
        let frame = match timeout(RESPONSE_GAP_TIMEOUT, read_frame(&mut stream)).await {
            Ok(frame) => frame.map_err(|e| {
                FetchError::peer_error_full("Connection lost", addr.to_string(), e.to_string())
            })?,
            Err(_) => {
                gaps += 1;
                if gaps >= MAX_RESPONSE_GAPS {
                    return Err(FetchError::peer_error_with_peer(
                        "Peer stopped responding",
                        addr.to_string(),
                    )
                    .into());
                }
                continue;
            }
        };

        // Everything that is not a ut_metadata message addressed to us
        // (bitfield, have, choke, keep-alives) is irrelevant here
        if frame.len() < 2 || frame[0] != EXTENSION_MESSAGE_ID || frame[1] != UT_METADATA_LOCAL_ID {
            continue;
        }

        match parse_metadata_message(&frame[2..])? {
            MetadataMessage::Data { piece, data, .. } => {
                trace!("{} | received metadata piece {}", addr, piece);
                pieces.insert(piece as usize, data)?;
                outstanding = outstanding.saturating_sub(1);
                if let Some(index) = pieces.next_to_request() {
                    write_frame(
                        &mut stream,
                        &build_metadata_request(extension.ut_metadata_id, index as u32)?,
                    )
                    .await?;
                    outstanding += 1;
                }
            }
            MetadataMessage::Reject { piece } => {
                return Err(FetchError::peer_error_full(
                    "Peer rejected metadata request",
                    addr.to_string(),
                    format!("piece {}", piece),
                )
                .into());
            }
            MetadataMessage::Request { .. } => {
                // We never serve metadata
            }
        }
    }

    let blob = pieces.assemble()?;
    let digest = Sha1::digest(&blob);
    if digest.as_slice() != info_hash {
        warn!(
            "{} | metadata hash mismatch: got {}, expected {}",
            addr,
            hex::encode(digest),
            hex::encode(info_hash)
        );
        return Err(FetchError::peer_error_with_peer("Metadata hash mismatch", addr.to_string()).into());
    }

    debug!("{} | metadata verified ({} bytes)", addr, blob.len());
    Ok(blob)
}

/// Read frames until the peer's extension handshake arrives
async fn await_extension_handshake(
    stream: &mut TcpStream,
    addr: SocketAddr,
) -> Result<crate::protocol::extension::ExtensionHandshake> {
    let mut gaps = 0u32;
    loop {
        let frame = match timeout(RESPONSE_GAP_TIMEOUT, read_frame(stream)).await {
            Ok(frame) => frame.map_err(|e| {
                FetchError::peer_error_full("Connection lost", addr.to_string(), e.to_string())
            })?,
            Err(_) => {
                gaps += 1;
                if gaps >= MAX_RESPONSE_GAPS {
                    return Err(FetchError::peer_error_with_peer(
                        "No extension handshake",
                        addr.to_string(),
                    )
                    .into());
                }
                continue;
            }
        };
        if frame.len() >= 2
            && frame[0] == EXTENSION_MESSAGE_ID
            && frame[1] == EXTENSION_HANDSHAKE_ID
        {
            return parse_extension_handshake(&frame[2..]);
        }
    }
}
