//! Wire framing
//!
//! Length-prefixed message framing for the BitTorrent peer-wire protocol:
//! every message is a 4-byte big-endian length followed by the payload.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::FetchError;
use crate::protocol::handshake::{Handshake, HANDSHAKE_LENGTH};

/// Upper bound on a single peer-wire message; a metadata piece plus its
/// bencoded header fits comfortably
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Write a handshake to the stream
pub async fn write_handshake<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    handshake: &Handshake,
) -> Result<()> {
    writer.write_all(&handshake.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a handshake from the stream
pub async fn read_handshake<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Handshake> {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader.read_exact(&mut buf).await?;
    Handshake::deserialize(&buf)
}

/// Write a length-prefixed message to the stream
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message from the stream.
///
/// Returns an empty payload for keep-alive messages. Oversized length
/// prefixes are a protocol violation.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf).await?;
    let length = u32::from_be_bytes(length_buf) as usize;

    if length == 0 {
        return Ok(Vec::new());
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(FetchError::protocol_error_with_source(
            "Message too large",
            format!("{} bytes", length),
        )
        .into());
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
