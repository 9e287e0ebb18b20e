//! Integrity checksums for chunks and whole files.
//!
//! Uses xxHash64 throughout: fast, good distribution, and cheap to compute
//! incrementally while streaming.

use xxhash_rust::xxh64::{Xxh64, xxh64};

/// Streaming xxHash64 hasher for whole-file checksums.
#[derive(Clone)]
pub struct StreamingHasher {
    inner: Xxh64,
}

impl StreamingHasher {
    /// Create a new hasher with seed 0.
    pub fn new() -> Self {
        Self { inner: Xxh64::new(0) }
    }

    /// Feed data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish and return the 64-bit digest.
    pub fn finish(&self) -> u64 {
        self.inner.digest()
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute xxHash64 for a single buffer.
pub fn hash_xxh64(data: &[u8]) -> u64 {
    xxh64(data, 0)
}
