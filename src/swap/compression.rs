//! Tile data compression for swap storage
//!
//! # Stream layout
//!
//! ```text
//! [1-byte method][payload]
//! ```
//!
//! Before compression the pixel bytes are linearised: byte `c` of every
//! pixel is gathered into plane `c`, so runs of equal channel values
//! (alpha, the high byte of 16-bit channels, ...) sit next to each other.
//! When zstd does not shrink the planes they are stored raw.

use crate::error::{Error, Result};
use crate::tiles::TileData;
use tracing::debug;

const HEADER_SIZE: usize = 1;

/// How the payload of a compressed tile is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    None = 0,
    Zstd = 1,
}

impl CompressionAlgorithm {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Zstd),
            other => Err(Error::CorruptSwapData(format!(
                "unknown compression method {}",
                other
            ))),
        }
    }
}

/// Lossless codec between tile pixel buffers and swap bytes
pub struct TileDataCompressor {
    level: i32,
    scratch: Vec<u8>,
}

impl TileDataCompressor {
    /// Create a compressor using the given zstd level
    pub fn new(level: i32) -> Self {
        Self {
            level,
            scratch: Vec::new(),
        }
    }

    /// Upper bound on the compressed size of `td`
    pub fn tile_data_buffer_size(&self, td: &TileData) -> usize {
        HEADER_SIZE + zstd::zstd_safe::compress_bound(td.buffer_size()).max(td.buffer_size())
    }

    /// Compress the resident pixels of `td` into `dest`
    ///
    /// `dest` must hold at least [`Self::tile_data_buffer_size`] bytes.
    /// Returns the number of bytes written.
    pub fn compress_tile_data(&mut self, td: &TileData, dest: &mut [u8]) -> Result<usize> {
        let data = td
            .data()
            .ok_or_else(|| Error::InvalidState("cannot compress swapped tile data".to_string()))?;

        let bound = self.tile_data_buffer_size(td);
        if dest.len() < bound {
            return Err(Error::InvalidArgument(format!(
                "compression buffer has {} bytes, needs {}",
                dest.len(),
                bound
            )));
        }

        linearize(data, td.format().pixel_size(), &mut self.scratch);

        let (header, body) = dest.split_at_mut(HEADER_SIZE);
        let packed = zstd::bulk::compress_to_buffer(&self.scratch, body, self.level)?;

        if packed < data.len() {
            header[0] = CompressionAlgorithm::Zstd as u8;
            Ok(HEADER_SIZE + packed)
        } else {
            debug!(raw = data.len(), packed, "Tile does not compress, storing raw");
            header[0] = CompressionAlgorithm::None as u8;
            body[..data.len()].copy_from_slice(&self.scratch);
            Ok(HEADER_SIZE + data.len())
        }
    }

    /// Decode `src` into a fresh pixel buffer installed on `td`
    ///
    /// `td` keeps its previous content if decoding fails.
    pub fn decompress_tile_data(&mut self, src: &[u8], td: &mut TileData) -> Result<()> {
        let expected = td.buffer_size();
        let (&tag, body) = src
            .split_first()
            .ok_or_else(|| Error::CorruptSwapData("empty tile stream".to_string()))?;

        match CompressionAlgorithm::from_tag(tag)? {
            CompressionAlgorithm::None => {
                if body.len() != expected {
                    return Err(Error::CorruptSwapData(format!(
                        "raw tile has {} bytes, expected {}",
                        body.len(),
                        expected
                    )));
                }
                self.scratch.clear();
                self.scratch.extend_from_slice(body);
            }
            CompressionAlgorithm::Zstd => {
                self.scratch.clear();
                self.scratch.resize(expected, 0);
                let unpacked = zstd::bulk::decompress_to_buffer(body, &mut self.scratch)
                    .map_err(|e| Error::CorruptSwapData(format!("zstd: {}", e)))?;
                if unpacked != expected {
                    return Err(Error::CorruptSwapData(format!(
                        "tile decoded to {} bytes, expected {}",
                        unpacked, expected
                    )));
                }
            }
        }

        let mut buffer = vec![0u8; expected];
        delinearize(&self.scratch, td.format().pixel_size(), &mut buffer);
        td.set_resident(buffer);
        Ok(())
    }
}

impl Default for TileDataCompressor {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Group byte `c` of every pixel into plane `c`
fn linearize(src: &[u8], pixel_size: usize, dst: &mut Vec<u8>) {
    dst.clear();
    dst.resize(src.len(), 0);
    let pixels = src.len() / pixel_size;
    for (i, pixel) in src.chunks_exact(pixel_size).enumerate() {
        for (c, &byte) in pixel.iter().enumerate() {
            dst[c * pixels + i] = byte;
        }
    }
}

fn delinearize(src: &[u8], pixel_size: usize, dst: &mut [u8]) {
    let pixels = src.len() / pixel_size;
    for (i, pixel) in dst.chunks_exact_mut(pixel_size).enumerate() {
        for (c, byte) in pixel.iter_mut().enumerate() {
            *byte = src[c * pixels + i];
        }
    }
}

/// How well swapped tiles compressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionStats {
    pub tiles: u64,
    /// Uncompressed bytes of those tiles
    pub raw_bytes: u64,
    /// Bytes they occupy in swap
    pub swapped_bytes: u64,
}

impl CompressionStats {
    /// `tiles` swapped tiles of `tile_bytes` each, taking `swapped_bytes`
    pub fn for_tiles(tiles: u64, tile_bytes: u64, swapped_bytes: u64) -> Self {
        Self {
            tiles,
            raw_bytes: tiles * tile_bytes,
            swapped_bytes,
        }
    }

    /// Swapped size over raw size, `None` with nothing swapped
    pub fn ratio(&self) -> Option<f64> {
        (self.raw_bytes > 0).then(|| self.swapped_bytes as f64 / self.raw_bytes as f64)
    }

    /// Negative when noisy tiles grew in their compressed form
    pub fn bytes_saved(&self) -> i64 {
        self.raw_bytes as i64 - self.swapped_bytes as i64
    }
}

impl std::fmt::Display for CompressionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tiles, {} -> {} bytes",
            self.tiles, self.raw_bytes, self.swapped_bytes
        )?;
        match self.ratio() {
            Some(ratio) => write!(f, " ({:.1}% saved)", (1.0 - ratio) * 100.0),
            None => Ok(()),
        }
    }
}
