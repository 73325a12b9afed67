//! Pluggable compression for tile layer payloads.

use crate::{Error, Result};

/// Compression strategy shared by the tile builder and the tile cache.
///
/// Implementations must be deterministic: compressing the same bytes twice
/// yields the same output, which persistence round-trips rely on.
pub trait TileCompressor: Send + Sync {
    /// Upper bound on the compressed size of `input_len` bytes.
    fn max_compressed_size(&self, input_len: usize) -> usize;

    /// Compresses `data` into a fresh buffer.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompresses `data` into a fresh buffer.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block compression with a length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl TileCompressor for Lz4Compressor {
    fn max_compressed_size(&self, input_len: usize) -> usize {
        // 4 bytes for the prepended size
        lz4_flex::block::get_maximum_output_size(input_len) + 4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::CorruptTile(format!("lz4 decompression failed: {e}")))
    }
}
