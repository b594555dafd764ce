//! Metadata piece assembly
//!
//! Tracks the state of every 16 KiB metadata piece during a session and
//! assembles the verified blob once all pieces are in.

use anyhow::Result;

use crate::error::FetchError;
use crate::protocol::extension::{MAX_METADATA_SIZE, METADATA_PIECE_SIZE};

/// State of a single metadata piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    Requested,
    Received(Vec<u8>),
}

/// Assembly state for one peer session's metadata download
#[derive(Debug)]
pub struct MetadataPieces {
    total_size: usize,
    pieces: Vec<PieceState>,
}

impl MetadataPieces {
    /// Create assembly state for a metadata blob of `total_size` bytes
    pub fn new(total_size: usize) -> Result<Self> {
        if total_size == 0 || total_size > MAX_METADATA_SIZE {
            return Err(FetchError::protocol_error_with_source(
                "Unacceptable metadata size",
                total_size.to_string(),
            )
            .into());
        }
        let piece_count = total_size.div_ceil(METADATA_PIECE_SIZE);
        Ok(Self {
            total_size,
            pieces: vec![PieceState::Missing; piece_count],
        })
    }

    /// Total metadata size in bytes
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Expected length of a piece: 16384 for all but possibly the last
    pub fn expected_piece_len(&self, index: usize) -> usize {
        if index + 1 == self.pieces.len() {
            self.total_size - index * METADATA_PIECE_SIZE
        } else {
            METADATA_PIECE_SIZE
        }
    }

    /// Pick the next missing piece and mark it requested
    pub fn next_to_request(&mut self) -> Option<usize> {
        let index = self.pieces.iter().position(|p| *p == PieceState::Missing)?;
        self.pieces[index] = PieceState::Requested;
        Some(index)
    }

    /// Store a received piece after validating its index and length
    pub fn insert(&mut self, index: usize, data: Vec<u8>) -> Result<()> {
        if index >= self.pieces.len() {
            return Err(FetchError::protocol_error_with_source(
                "Piece index out of range",
                format!("{} of {}", index, self.pieces.len()),
            )
            .into());
        }
        if matches!(self.pieces[index], PieceState::Received(_)) {
            return Err(FetchError::protocol_error_with_source(
                "Duplicate metadata piece",
                index.to_string(),
            )
            .into());
        }
        let expected = self.expected_piece_len(index);
        if data.len() != expected {
            return Err(FetchError::protocol_error_with_source(
                "Wrong metadata piece length",
                format!("piece {}: expected {} bytes, got {}", index, expected, data.len()),
            )
            .into());
        }
        self.pieces[index] = PieceState::Received(data);
        Ok(())
    }

    /// Whether every piece has been received
    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| matches!(p, PieceState::Received(_)))
    }

    /// Concatenate the pieces in index order
    pub fn assemble(self) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(self.total_size);
        for (index, piece) in self.pieces.into_iter().enumerate() {
            let PieceState::Received(data) = piece else {
                return Err(FetchError::protocol_error_with_source(
                    "Metadata incomplete",
                    format!("piece {} missing", index),
                )
                .into());
            };
            blob.extend_from_slice(&data);
        }
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_count() {
        assert_eq!(MetadataPieces::new(1).unwrap().piece_count(), 1);
        assert_eq!(MetadataPieces::new(16384).unwrap().piece_count(), 1);
        assert_eq!(MetadataPieces::new(16385).unwrap().piece_count(), 2);
        assert_eq!(MetadataPieces::new(32768).unwrap().piece_count(), 2);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(MetadataPieces::new(0).is_err());
        assert!(MetadataPieces::new(MAX_METADATA_SIZE + 1).is_err());
        assert!(MetadataPieces::new(MAX_METADATA_SIZE).is_ok());
    }

    #[test]
    fn test_expected_piece_len() {
        let pieces = MetadataPieces::new(20000).unwrap();
        assert_eq!(pieces.expected_piece_len(0), 16384);
        assert_eq!(pieces.expected_piece_len(1), 3616);

        let exact = MetadataPieces::new(32768).unwrap();
        assert_eq!(exact.expected_piece_len(1), 16384);
    }

    #[test]
    fn test_next_to_request_marks_pieces() {
        let mut pieces = MetadataPieces::new(32768).unwrap();
        assert_eq!(pieces.next_to_request(), Some(0));
        assert_eq!(pieces.next_to_request(), Some(1));
        assert_eq!(pieces.next_to_request(), None);
    }

    #[test]
    fn test_insert_and_assemble_in_order() {
        let mut pieces = MetadataPieces::new(20000).unwrap();
        pieces.insert(1, vec![2u8; 3616]).unwrap();
        pieces.insert(0, vec![1u8; 16384]).unwrap();
        assert!(pieces.is_complete());

        let blob = pieces.assemble().unwrap();
        assert_eq!(blob.len(), 20000);
        assert!(blob[..16384].iter().all(|&b| b == 1));
        assert!(blob[16384..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_insert_rejects_wrong_length() {
        let mut pieces = MetadataPieces::new(20000).unwrap();
        assert!(pieces.insert(0, vec![0u8; 100]).is_err());
        assert!(pieces.insert(1, vec![0u8; 16384]).is_err());
    }

    #[test]
    fn test_insert_rejects_out_of_range() {
        let mut pieces = MetadataPieces::new(16384).unwrap();
        assert!(pieces.insert(1, vec![0u8; 16384]).is_err());
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let mut pieces = MetadataPieces::new(16384).unwrap();
        pieces.insert(0, vec![0u8; 16384]).unwrap();
        assert!(pieces.insert(0, vec![0u8; 16384]).is_err());
    }

    #[test]
    fn test_assemble_incomplete_errors() {
        let mut pieces = MetadataPieces::new(32768).unwrap();
        pieces.insert(0, vec![0u8; 16384]).unwrap();
        assert!(!pieces.is_complete());
        assert!(pieces.assemble().is_err());
    }
}
