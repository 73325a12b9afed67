//! Compressed tile layer blobs.
//!
//! A stored tile is a fixed 54-byte little-endian header followed by the
//! LZ4-compressed cell grids (heights, areas, connectivity, in that order).
//! The header stays uncompressed so tiles can be located and queried
//! without touching the payload.

use crate::compressor::TileCompressor;
use crate::{Error, Result};

/// Identifies a serialized tile layer ('TILE' stored little-endian).
pub const LAYER_MAGIC: i32 = 0x4C494554;
/// Current tile layer format version.
pub const LAYER_VERSION: i32 = 1;
/// Serialized header size in bytes.
pub const LAYER_HEADER_SIZE: usize = 54;

/// Uncompressed header of a stored tile layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileLayerHeader {
    pub magic: i32,
    pub version: i32,
    /// Tile column
    pub tx: i32,
    /// Tile row
    pub ty: i32,
    /// Layer index within the tile
    pub tlayer: i32,
    /// World-space minimum bounds of the layer
    pub bmin: [f32; 3],
    /// World-space maximum bounds of the layer
    pub bmax: [f32; 3],
    /// Lowest floor in cell units
    pub hmin: u16,
    /// Highest floor in cell units
    pub hmax: u16,
    /// Grid width in cells
    pub width: u8,
    /// Grid height in cells
    pub height: u8,
    /// Usable data bounds within the grid
    pub minx: u8,
    pub maxx: u8,
    pub miny: u8,
    pub maxy: u8,
}

impl TileLayerHeader {
    /// Serializes the header into its fixed little-endian layout.
    pub fn to_bytes(&self) -> [u8; LAYER_HEADER_SIZE] {
        let mut bytes = [0u8; LAYER_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.tx.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.ty.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.tlayer.to_le_bytes());
        for (i, v) in self.bmin.iter().enumerate() {
            bytes[20 + i * 4..24 + i * 4].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in self.bmax.iter().enumerate() {
            bytes[32 + i * 4..36 + i * 4].copy_from_slice(&v.to_le_bytes());
        }
        bytes[44..46].copy_from_slice(&self.hmin.to_le_bytes());
        bytes[46..48].copy_from_slice(&self.hmax.to_le_bytes());
        bytes[48] = self.width;
        bytes[49] = self.height;
        bytes[50] = self.minx;
        bytes[51] = self.maxx;
        bytes[52] = self.miny;
        bytes[53] = self.maxy;
        bytes
    }

    /// Parses and validates a header from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < LAYER_HEADER_SIZE {
            return Err(Error::Format(format!(
                "tile layer header truncated: {} bytes",
                data.len()
            )));
        }
        let read_i32 = |off: usize| i32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        let read_f32 = |off: usize| f32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        let read_u16 = |off: usize| u16::from_le_bytes([data[off], data[off + 1]]);

        let magic = read_i32(0);
        if magic != LAYER_MAGIC {
            return Err(Error::Format(format!(
                "bad tile layer magic 0x{magic:08X}"
            )));
        }
        let version = read_i32(4);
        if version != LAYER_VERSION {
            return Err(Error::Format(format!(
                "unsupported tile layer version {version}"
            )));
        }

        let header = Self {
            magic,
            version,
            tx: read_i32(8),
            ty: read_i32(12),
            tlayer: read_i32(16),
            bmin: [read_f32(20), read_f32(24), read_f32(28)],
            bmax: [read_f32(32), read_f32(36), read_f32(40)],
            hmin: read_u16(44),
            hmax: read_u16(46),
            width: data[48],
            height: data[49],
            minx: data[50],
            maxx: data[51],
            miny: data[52],
            maxy: data[53],
        };
        // The data bounds index into width x height grids; reject anything
        // that would reach outside them.
        if header.width == 0
            || header.height == 0
            || header.minx > header.maxx
            || header.maxx >= header.width
            || header.miny > header.maxy
            || header.maxy >= header.height
            || header.hmin > header.hmax
        {
            return Err(Error::Format(format!(
                "tile layer header has inconsistent bounds ({}..{} x {}..{} in {}x{})",
                header.minx, header.maxx, header.miny, header.maxy, header.width, header.height
            )));
        }
        Ok(header)
    }

    /// Cell count of the stored grids.
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Fully decoded tile layer: header plus decompressed cell grids.
#[derive(Debug, Clone, PartialEq)]
pub struct TileLayer {
    pub header: TileLayerHeader,
    pub heights: Vec<u8>,
    pub areas: Vec<u8>,
    pub cons: Vec<u8>,
}

/// Assembles a compressed blob from a header and its cell grids.
pub fn encode_layer(
    header: &TileLayerHeader,
    payload: &[u8],
    compressor: &dyn TileCompressor,
) -> Result<Vec<u8>> {
    if payload.len() != header.cell_count() * 3 {
        return Err(Error::CorruptTile(format!(
            "layer payload is {} bytes, expected {}",
            payload.len(),
            header.cell_count() * 3
        )));
    }
    let mut blob = Vec::with_capacity(
        LAYER_HEADER_SIZE + compressor.max_compressed_size(payload.len()),
    );
    blob.extend_from_slice(&header.to_bytes());
    blob.extend_from_slice(&compressor.compress(payload)?);
    Ok(blob)
}

/// Parses a blob's header without decompressing the payload.
pub fn peek_header(blob: &[u8]) -> Result<TileLayerHeader> {
    TileLayerHeader::from_bytes(blob)
}

/// Decompresses and validates a full tile layer.
pub fn decode_layer(blob: &[u8], compressor: &dyn TileCompressor) -> Result<TileLayer> {
    let header = TileLayerHeader::from_bytes(blob)?;
    let grids = compressor.decompress(&blob[LAYER_HEADER_SIZE..])?;
    let n = header.cell_count();
    if grids.len() != n * 3 {
        return Err(Error::CorruptTile(format!(
            "decompressed layer is {} bytes, expected {}",
            grids.len(),
            n * 3
        )));
    }
    Ok(TileLayer {
        header,
        heights: grids[0..n].to_vec(),
        areas: grids[n..n * 2].to_vec(),
        cons: grids[n * 2..n * 3].to_vec(),
    })
}
