//! Compression extension
//!
//! zstd compression for payloads of frames flagged `compressed`. The flag is
//! authoritative: a flagged payload is always compressed, whatever its size.

use thiserror::Error;

/// Default zstd compression level (1-22, higher = smaller but slower)
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Default ceiling on a decompressed payload (16 MiB).
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Errors from compression operations.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Zstd compression failed.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// Zstd decompression failed.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Decompressed size exceeds safety limit (DoS protection).
    #[error("decompressed size exceeded limit: {size} > {limit}")]
    SizeExceeded {
        /// Bytes produced before giving up.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}

/// Compression configuration
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Compression level (1-22)
    pub level: i32,
    /// Maximum decompressed size (for DoS protection)
    pub max_decompressed_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }
}

/// Compressor for frame payloads
#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    /// Create a new compressor with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a compressor with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Set compression level
    pub fn set_level(&mut self, level: i32) {
        self.config.level = level.clamp(1, 22);
    }

    /// Get compression level
    pub fn level(&self) -> i32 {
        self.config.level
    }

    /// Compress data.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(data, self.config.level)
            .map_err(|e| CompressionError::CompressionFailed(e.to_string()))
    }

    /// Decompress data, refusing output beyond the configured limit.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        self.decompress_with_limit(data, self.config.max_decompressed_size)
    }

    /// Decompress data with explicit size limit
    pub fn decompress_with_limit(
        &self,
        data: &[u8],
        max_size: usize,
    ) -> Result<Vec<u8>, CompressionError> {
        use std::io::Read;

        let decoder = zstd::Decoder::new(data)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

        // Read one byte past the limit so oversize output is detected without
        // inflating all of it.
        let mut output = Vec::new();
        decoder
            .take(max_size as u64 + 1)
            .read_to_end(&mut output)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

        if output.len() > max_size {
            return Err(CompressionError::SizeExceeded {
                size: output.len(),
                limit: max_size,
            });
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let compressor = Compressor::new();
        let data = b"keepalive keepalive keepalive keepalive keepalive".repeat(8);
        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_small_payload_still_compressed() {
        let compressor = Compressor::new();
        let compressed = compressor.compress(b"x").unwrap();
        assert_ne!(compressed, b"x");
        assert_eq!(compressor.decompress(&compressed).unwrap(), b"x");
    }

    #[test]
    fn test_decompression_limit() {
        let compressor = Compressor::new();
        let data = vec![0u8; 10_000];
        let compressed = compressor.compress(&data).unwrap();
        let result = compressor.decompress_with_limit(&compressed, 1000);
        assert!(matches!(
            result,
            Err(CompressionError::SizeExceeded { limit: 1000, .. })
        ));
    }

    #[test]
    fn test_invalid_data() {
        let compressor = Compressor::new();
        assert!(compressor.decompress(b"not zstd at all").is_err());
    }

    #[test]
    fn test_level_clamped() {
        let mut compressor = Compressor::new();
        compressor.set_level(100);
        assert_eq!(compressor.level(), 22);
        compressor.set_level(-5);
        assert_eq!(compressor.level(), 1);
    }
}
