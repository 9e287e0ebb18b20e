//! Chunk construction and verification.

use crate::checksum::hash_xxh64;
use crate::protocol::ChunkPayload;

/// Build a chunk payload, computing its checksum.
pub fn make_chunk(seq: u64, data: Vec<u8>, compressed: bool, last: bool) -> ChunkPayload {
    let checksum = hash_xxh64(&data);
    ChunkPayload {
        seq,
        checksum,
        compressed,
        last,
        data,
    }
}

/// Verify a received chunk's integrity.
pub fn verify_chunk(chunk: &ChunkPayload) -> bool {
    hash_xxh64(&chunk.data) == chunk.checksum
}

/// Chunk payload size for the legacy line protocol.
///
/// Legacy frames travel as base64 lines through a pty; sizing the payload
/// relative to the terminal width keeps a frame to a bounded number of
/// wrapped rows and avoids pathological churn on narrow terminals.
pub fn chunk_size_for_cols(cols: u16) -> usize {
    let cols = cols.clamp(40, 500) as usize;
    (cols * 64).clamp(1024, 16 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_and_verify() {
        let chunk = make_chunk(3, vec![1, 2, 3, 4], false, false);
        assert_eq!(chunk.seq, 3);
        assert!(verify_chunk(&chunk));
    }

    #[test]
    fn corrupted_chunk_fails_verification() {
        let mut chunk = make_chunk(0, vec![9; 128], false, true);
        chunk.data[5] ^= 0xFF;
        assert!(!verify_chunk(&chunk));
    }

    #[test]
    fn empty_chunk_verifies() {
        let chunk = make_chunk(0, Vec::new(), false, true);
        assert!(verify_chunk(&chunk));
    }

    #[test]
    fn legacy_chunk_size_scales_with_width() {
        assert!(chunk_size_for_cols(40) < chunk_size_for_cols(200));
        // Clamped at both ends
        assert_eq!(chunk_size_for_cols(10), chunk_size_for_cols(40));
        assert_eq!(chunk_size_for_cols(500), 16 * 1024);
    }
}
