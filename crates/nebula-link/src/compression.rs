//! LZ4 compression for large message payloads.
//!
//! Payloads at or above the configured threshold are compressed with LZ4
//! (block format with the uncompressed size prepended as a `u32` LE). The
//! choice between compressed and plain is signalled by the frame opcode or
//! stream marker, not by this module.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Controls when payloads are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum serialized size (bytes) before compression is applied. Default: 13 KiB.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 13 * 1024,
            enabled: true,
        }
    }
}

impl CompressionConfig {
    /// Whether a payload of `len` bytes should be compressed.
    pub fn should_compress(&self, len: usize) -> bool {
        self.enabled && len >= self.threshold
    }
}

/// Compress `data` with a prepended size header.
pub fn compress(data: &[u8]) -> Vec<u8> {
    compress_prepend_size(data)
}

/// Decompress a size-prepended LZ4 block.
///
/// The declared size is checked against `max_size` before any allocation, so
/// a hostile header cannot make us reserve gigabytes.
pub fn decompress(data: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError> {
    let header: [u8; 4] = data
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or(CompressionError::Truncated)?;
    let declared = u32::from_le_bytes(header) as usize;
    if declared > max_size {
        return Err(CompressionError::TooLarge {
            size: declared,
            max: max_size,
        });
    }
    decompress_size_prepended(data).map_err(|e| CompressionError::Failed(e.to_string()))
}

/// Errors that can occur during payload decompression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Fewer than four bytes, so no size header.
    #[error("compressed block shorter than its size header")]
    Truncated,
    /// The declared uncompressed size exceeds the frame limit.
    #[error("declared size {size} exceeds maximum {max}")]
    TooLarge {
        /// Declared uncompressed size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    Failed(String),
}
