//! Compression utilities for chunk payloads.
//!
//! Uses zstd per chunk when the negotiated configuration enables it.
//! When the `compression` feature is disabled, provides passthrough stubs.

use crate::error::{Error, Result};

/// Default compression level (3 = fast with reasonable ratio).
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// File extensions that are already compressed (skip compression).
const COMPRESSED_EXTENSIONS: &[&str] = &[
    "gz", "zip", "bz2", "xz", "lz4", "zst", "7z", "rar", "jpg", "jpeg", "png", "gif", "webp",
    "mp3", "mp4", "mkv", "avi", "mov", "flac", "ogg", "opus", "pdf",
];

/// Compressor for chunk data.
#[derive(Debug)]
pub struct Compressor {
    #[cfg(feature = "compression")]
    level: i32,
}

impl Compressor {
    /// Create a new compressor with the given compression level.
    #[cfg(feature = "compression")]
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    #[cfg(not(feature = "compression"))]
    pub fn new(_level: i32) -> Self {
        Self {}
    }

    /// Create a new compressor with the default compression level.
    pub fn with_default_level() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }

    /// Compress a block of data.
    #[cfg(feature = "compression")]
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level).map_err(|e| Error::FileTransfer {
            message: format!("compression failed: {}", e),
        })
    }

    /// Compress a block of data (no-op when compression disabled).
    #[cfg(not(feature = "compression"))]
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    /// Check if compression is worthwhile for the given data.
    ///
    /// Returns false if the data is too small or looks incompressible.
    #[cfg(feature = "compression")]
    pub fn should_compress(&self, data: &[u8]) -> bool {
        // Don't compress very small blocks
        if data.len() < 256 {
            return false;
        }

        // Sample-based entropy check (quick heuristic)
        let sample_size = data.len().min(1024);
        let sample = &data[..sample_size];

        let mut byte_counts = [0u32; 256];
        for &b in sample {
            byte_counts[b as usize] += 1;
        }

        let unique_bytes = byte_counts.iter().filter(|&&c| c > 0).count();

        // If more than 200 unique bytes in sample, likely not very compressible
        unique_bytes < 200
    }

    /// Check if compression is worthwhile (always false when compression disabled).
    #[cfg(not(feature = "compression"))]
    pub fn should_compress(&self, _data: &[u8]) -> bool {
        false
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::with_default_level()
    }
}

/// Decompressor for chunk data.
#[derive(Debug, Default)]
pub struct Decompressor;

impl Decompressor {
    /// Create a new decompressor.
    pub fn new() -> Self {
        Self
    }

    /// Decompress a block of data.
    #[cfg(feature = "compression")]
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| Error::FileTransfer {
            message: format!("decompression failed: {}", e),
        })
    }

    /// Decompress a block of data (passthrough when compression disabled).
    #[cfg(not(feature = "compression"))]
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Check if a file path has a compressed extension.
pub fn is_compressed_extension(path: &str) -> bool {
    let lower = path.to_lowercase();
    COMPRESSED_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}
