//! Tile pixel payloads

use super::pixel::PixelFormat;
use crate::error::{Error, Result};
use crate::swap::Chunk;
use std::sync::Arc;

/// Where a tile's pixels currently live
#[derive(Debug, Clone)]
pub enum TileContent {
    /// In memory. The buffer may be shared with other tiles until the
    /// first write.
    Resident(Arc<Vec<u8>>),
    /// Compressed in the swap file
    Swapped(Chunk),
    /// Owning tile is gone; no buffer and no chunk
    Forgotten,
}

/// Coarse state of a [`TileData`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileDataState {
    Resident,
    Swapped,
    Forgotten,
}

/// The mutable pixel payload of one tile
///
/// Holding `&mut TileData` is what the swap layer treats as holding the
/// tile's lock: the tile grid keeps every `TileData` behind its own mutex.
#[derive(Debug, Clone)]
pub struct TileData {
    tile_size: u32,
    format: PixelFormat,
    content: TileContent,
}

impl TileData {
    /// Wrap an existing buffer
    ///
    /// Fails if the buffer length does not match the tile geometry.
    pub fn new(tile_size: u32, format: PixelFormat, buffer: Arc<Vec<u8>>) -> Result<Self> {
        let expected = Self::expected_size(tile_size, format);
        if buffer.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "tile buffer has {} bytes, expected {}",
                buffer.len(),
                expected
            )));
        }
        Ok(Self {
            tile_size,
            format,
            content: TileContent::Resident(buffer),
        })
    }

    /// A tile whose every pixel equals `pixel`
    pub fn filled(tile_size: u32, format: PixelFormat, pixel: &[u8]) -> Result<Self> {
        if pixel.len() != format.pixel_size() {
            return Err(Error::InvalidArgument(format!(
                "pixel has {} bytes, format needs {}",
                pixel.len(),
                format.pixel_size()
            )));
        }
        let count = (tile_size * tile_size) as usize;
        let buffer = pixel.repeat(count);
        Self::new(tile_size, format, Arc::new(buffer))
    }

    fn expected_size(tile_size: u32, format: PixelFormat) -> usize {
        (tile_size as usize) * (tile_size as usize) * format.pixel_size()
    }

    /// Pixels along one tile edge
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Pixel layout
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes of an uncompressed pixel buffer
    pub fn buffer_size(&self) -> usize {
        Self::expected_size(self.tile_size, self.format)
    }

    /// Current state
    pub fn state(&self) -> TileDataState {
        match self.content {
            TileContent::Resident(_) => TileDataState::Resident,
            TileContent::Swapped(_) => TileDataState::Swapped,
            TileContent::Forgotten => TileDataState::Forgotten,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.content, TileContent::Resident(_))
    }

    pub fn is_swapped(&self) -> bool {
        matches!(self.content, TileContent::Swapped(_))
    }

    /// Pixel bytes, if resident
    pub fn data(&self) -> Option<&[u8]> {
        match &self.content {
            TileContent::Resident(buffer) => Some(buffer.as_slice()),
            _ => None,
        }
    }

    /// Mutable pixel bytes, if resident
    ///
    /// A buffer shared with other tiles is copied first.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.content {
            TileContent::Resident(buffer) => Some(Arc::make_mut(buffer).as_mut_slice()),
            _ => None,
        }
    }

    /// Whether this tile still shares `buffer` without having copied it
    pub fn shares_buffer(&self, buffer: &Arc<Vec<u8>>) -> bool {
        matches!(&self.content, TileContent::Resident(own) if Arc::ptr_eq(own, buffer))
    }

    /// Chunk holding the swapped pixels, if swapped
    pub fn swap_chunk(&self) -> Option<Chunk> {
        match self.content {
            TileContent::Swapped(chunk) => Some(chunk),
            _ => None,
        }
    }

    /// Drop the in-memory buffer and record where the pixels went
    pub(crate) fn set_swapped(&mut self, chunk: Chunk) {
        self.content = TileContent::Swapped(chunk);
    }

    /// Install a freshly decoded buffer, clearing the chunk
    pub(crate) fn set_resident(&mut self, buffer: Vec<u8>) {
        self.content = TileContent::Resident(Arc::new(buffer));
    }

    pub(crate) fn set_forgotten(&mut self) {
        self.content = TileContent::Forgotten;
    }
}
