//! Sparse tile grid
//!
//! # Architecture
//!
//! ```text
//! TiledDataManager
//!   ├─→ tiles: (col, row) → Mutex<TileData>     (DashMap, sparse)
//!   ├─→ default tile buffer                     (shared until first write)
//!   ├─→ residency: LRU of resident tiles        (swap victims come from the cold end)
//!   └─→ SwappedDataStore                        (optional, shared between managers)
//! ```
//!
//! Pixels outside any tile read as the default pixel. A tile is created on
//! first write and starts out sharing the default buffer.
//!
//! Lock order is shard → tile → residency. The residency lock is never held
//! while a tile is locked by the same thread in the other direction.

use super::pixel::PixelFormat;
use super::tile_data::TileData;
use crate::device::{Rect, Region};
use crate::error::{Error, Result};
use crate::swap::SwappedDataStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Column and row of a tile
pub type TileIndex = (i32, i32);

type TileHandle = Arc<Mutex<TileData>>;

struct DefaultTile {
    pixel: Vec<u8>,
    buffer: Arc<Vec<u8>>,
}

/// Sparse grid of tiles with optional swapping
pub struct TiledDataManager {
    tile_size: u32,
    format: PixelFormat,
    default_tile: RwLock<DefaultTile>,
    tiles: DashMap<TileIndex, TileHandle>,
    swap: Option<Arc<SwappedDataStore>>,
    residency: Mutex<LruCache<TileIndex, ()>>,
    resident_bytes: AtomicU64,
    memory_limit: u64,
}

impl TiledDataManager {
    /// Create an empty grid whose every pixel reads as `default_pixel`
    pub fn new(tile_size: u32, format: PixelFormat, default_pixel: &[u8]) -> Result<Self> {
        let default_tile = TileData::filled(tile_size, format, default_pixel)?;
        let buffer = Arc::new(default_tile.data().map(<[u8]>::to_vec).unwrap_or_default());

        Ok(Self {
            tile_size,
            format,
            default_tile: RwLock::new(DefaultTile {
                pixel: default_pixel.to_vec(),
                buffer,
            }),
            tiles: DashMap::new(),
            swap: None,
            residency: Mutex::new(LruCache::unbounded()),
            resident_bytes: AtomicU64::new(0),
            memory_limit: u64::MAX,
        })
    }

    /// Attach a swap store; tiles beyond `memory_limit` resident bytes
    /// become candidates for [`Self::enforce_memory_limit`]
    pub fn with_swap(mut self, store: Arc<SwappedDataStore>, memory_limit: u64) -> Self {
        self.swap = Some(store);
        self.memory_limit = memory_limit;
        self
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixel_size(&self) -> usize {
        self.format.pixel_size()
    }

    /// Bytes of one tile buffer
    pub fn tile_bytes(&self) -> u64 {
        (self.tile_size as u64).pow(2) * self.pixel_size() as u64
    }

    pub fn default_pixel(&self) -> Vec<u8> {
        self.default_tile.read().pixel.clone()
    }

    /// Change the pixel reported outside of tiles
    ///
    /// Existing tiles keep their content.
    pub fn set_default_pixel(&self, pixel: &[u8]) -> Result<()> {
        let tile = TileData::filled(self.tile_size, self.format, pixel)?;
        let buffer = Arc::new(tile.data().map(<[u8]>::to_vec).unwrap_or_default());
        *self.default_tile.write() = DefaultTile {
            pixel: pixel.to_vec(),
            buffer,
        };
        Ok(())
    }

    pub fn tile_index(&self, x: i32, y: i32) -> TileIndex {
        let size = self.tile_size as i32;
        (x.div_euclid(size), y.div_euclid(size))
    }

    pub fn tile_rect(&self, (col, row): TileIndex) -> Rect {
        let size = self.tile_size as i32;
        Rect::new(col * size, row * size, size, size)
    }

    fn pixel_offset(&self, x: i32, y: i32) -> usize {
        let size = self.tile_size as i32;
        let (lx, ly) = (x.rem_euclid(size) as usize, y.rem_euclid(size) as usize);
        (ly * self.tile_size as usize + lx) * self.pixel_size()
    }

    fn tile(&self, index: TileIndex) -> Option<TileHandle> {
        self.tiles.get(&index).map(|t| t.value().clone())
    }

    fn tile_or_create(&self, index: TileIndex) -> Result<TileHandle> {
        if let Some(tile) = self.tile(index) {
            return Ok(tile);
        }

        let buffer = self.default_tile.read().buffer.clone();
        let td = TileData::new(self.tile_size, self.format, buffer)?;

        let (handle, created) = match self.tiles.entry(index) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let handle = Arc::new(Mutex::new(td));
                entry.insert(handle.clone());
                (handle, true)
            }
        };

        if created {
            self.resident_bytes
                .fetch_add(self.tile_bytes(), Ordering::Relaxed);
            self.touch(index);
        }
        Ok(handle)
    }

    fn touch(&self, index: TileIndex) {
        self.residency.lock().put(index, ());
    }

    /// Swap `td` back in if needed and mark it recently used
    ///
    /// A forgotten tile was removed from the grid while the caller waited
    /// on its lock and is left out of the residency list.
    fn make_resident(&self, index: TileIndex, td: &mut TileData) -> Result<()> {
        if td.is_swapped() {
            let store = self.swap.as_ref().ok_or_else(|| {
                Error::InvalidState("swapped tile in a grid without swap".to_string())
            })?;
            store.swap_in_tile_data(td)?;
            self.resident_bytes
                .fetch_add(self.tile_bytes(), Ordering::Relaxed);
        }
        if td.is_resident() {
            self.touch(index);
        }
        Ok(())
    }

    /// Read one pixel
    pub fn read_pixel(&self, x: i32, y: i32) -> Result<Vec<u8>> {
        let index = self.tile_index(x, y);
        let Some(tile) = self.tile(index) else {
            return Ok(self.default_pixel());
        };

        let mut td = tile.lock();
        self.make_resident(index, &mut td)?;
        let offset = self.pixel_offset(x, y);
        let data = td
            .data()
            .ok_or_else(|| Error::InvalidState(format!("tile {:?} has no pixels", index)))?;
        Ok(data[offset..offset + self.pixel_size()].to_vec())
    }

    /// Write one pixel, creating its tile if needed
    pub fn write_pixel(&self, x: i32, y: i32, pixel: &[u8]) -> Result<()> {
        self.check_pixel(pixel)?;
        let index = self.tile_index(x, y);
        let tile = self.tile_or_create(index)?;

        let mut td = tile.lock();
        self.make_resident(index, &mut td)?;
        let offset = self.pixel_offset(x, y);
        let data = td
            .data_mut()
            .ok_or_else(|| Error::InvalidState(format!("tile {:?} has no pixels", index)))?;
        data[offset..offset + pixel.len()].copy_from_slice(pixel);
        Ok(())
    }

    /// Set every pixel of `rect` to `pixel`
    pub fn fill_rect(&self, rect: Rect, pixel: &[u8]) -> Result<()> {
        self.check_pixel(pixel)?;
        if rect.is_empty() {
            return Ok(());
        }

        let (first_col, first_row) = self.tile_index(rect.x, rect.y);
        let (last_col, last_row) = self.tile_index(rect.right() - 1, rect.bottom() - 1);

        for row in first_row..=last_row {
            for col in first_col..=last_col {
                let index = (col, row);
                let area = self.tile_rect(index).intersected(&rect);
                let tile = self.tile_or_create(index)?;

                let mut td = tile.lock();
                self.make_resident(index, &mut td)?;
                let data = td.data_mut().ok_or_else(|| {
                    Error::InvalidState(format!("tile {:?} has no pixels", index))
                })?;

                for y in area.y..area.bottom() {
                    let start = self.pixel_offset(area.x, y);
                    let end = start + area.width as usize * pixel.len();
                    for dst in data[start..end].chunks_exact_mut(pixel.len()) {
                        dst.copy_from_slice(pixel);
                    }
                }
            }
        }

        debug!(?rect, "Filled rect");
        Ok(())
    }

    fn check_pixel(&self, pixel: &[u8]) -> Result<()> {
        if pixel.len() != self.pixel_size() {
            return Err(Error::InvalidArgument(format!(
                "pixel has {} bytes, format {:?} needs {}",
                pixel.len(),
                self.format,
                self.pixel_size()
            )));
        }
        Ok(())
    }

    /// Drop one tile, releasing its memory or swap chunk
    pub fn remove_tile(&self, index: TileIndex) -> Result<bool> {
        let Some((_, tile)) = self.tiles.remove(&index) else {
            return Ok(false);
        };

        let mut td = tile.lock();
        if td.is_resident() {
            self.resident_bytes
                .fetch_sub(self.tile_bytes(), Ordering::Relaxed);
        }
        self.residency.lock().pop(&index);
        match &self.swap {
            Some(store) => store.forget_tile_data(&mut td)?,
            None => td.set_forgotten(),
        }
        Ok(true)
    }

    /// Drop every tile
    pub fn clear(&self) -> Result<()> {
        for index in self.tile_indices() {
            self.remove_tile(index)?;
        }
        Ok(())
    }

    /// Indices of every existing tile
    pub fn tile_indices(&self) -> Vec<TileIndex> {
        self.tiles.iter().map(|e| *e.key()).collect()
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Tiles whose pixels are currently in swap
    pub fn swapped_tile_count(&self) -> usize {
        self.tiles
            .iter()
            .filter(|entry| entry.value().lock().is_swapped())
            .count()
    }

    /// Bytes of tile buffers counted as resident
    ///
    /// Tiles still sharing the default buffer are counted at full size.
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    /// Tile-aligned bounding box of all tiles; may overestimate content
    pub fn extent(&self) -> Rect {
        self.tiles
            .iter()
            .fold(Rect::empty(), |acc, e| acc.united(&self.tile_rect(*e.key())))
    }

    /// Tile-aligned area covered by tiles
    pub fn region(&self) -> Region {
        Region::from_rects(self.tiles.iter().map(|e| self.tile_rect(*e.key())).collect())
    }

    /// Bounding box of pixels that differ from the default pixel
    ///
    /// Tiles are scanned in parallel; swapped tiles are brought back in.
    pub fn non_default_bounds(&self) -> Result<Rect> {
        let (default_pixel, default_buffer) = {
            let default = self.default_tile.read();
            (default.pixel.clone(), default.buffer.clone())
        };
        let tiles: Vec<(TileIndex, TileHandle)> = self
            .tiles
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        tiles
            .par_iter()
            .map(|(index, tile)| -> Result<Rect> {
                let mut td = tile.lock();
                if td.shares_buffer(&default_buffer) {
                    return Ok(Rect::empty());
                }
                self.make_resident(*index, &mut td)?;
                let data = td.data().ok_or_else(|| {
                    Error::InvalidState(format!("tile {:?} has no pixels", index))
                })?;
                Ok(self.content_bounds(*index, data, &default_pixel))
            })
            .try_reduce(Rect::empty, |a, b| Ok(a.united(&b)))
    }

    fn content_bounds(&self, index: TileIndex, data: &[u8], default_pixel: &[u8]) -> Rect {
        let size = self.tile_size as usize;
        let mut min = (size, size);
        let mut max = (0usize, 0usize);
        let mut found = false;

        for (i, pixel) in data.chunks_exact(self.pixel_size()).enumerate() {
            if pixel != default_pixel {
                let (x, y) = (i % size, i / size);
                min = (min.0.min(x), min.1.min(y));
                max = (max.0.max(x), max.1.max(y));
                found = true;
            }
        }

        if !found {
            return Rect::empty();
        }
        let origin = self.tile_rect(index);
        Rect::new(
            origin.x + min.0 as i32,
            origin.y + min.1 as i32,
            (max.0 - min.0 + 1) as i32,
            (max.1 - min.1 + 1) as i32,
        )
    }

    /// Move one tile to swap
    ///
    /// Returns `false` if the tile does not exist or is already swapped.
    pub fn swap_out_tile(&self, index: TileIndex) -> Result<bool> {
        let store = self
            .swap
            .as_ref()
            .ok_or_else(|| Error::InvalidState("grid has no swap store".to_string()))?;
        let Some(tile) = self.tile(index) else {
            return Ok(false);
        };

        let mut td = tile.lock();
        if !td.is_resident() {
            return Ok(false);
        }
        store.try_swap_out_tile_data(&mut td)?;
        self.resident_bytes
            .fetch_sub(self.tile_bytes(), Ordering::Relaxed);
        self.residency.lock().pop(&index);
        Ok(true)
    }

    /// Swap out least recently used tiles until resident bytes fit the limit
    ///
    /// Returns how many tiles were swapped. If the store refuses a tile, it
    /// stays resident and the error is returned.
    pub fn enforce_memory_limit(&self) -> Result<usize> {
        if self.swap.is_none() {
            return Ok(0);
        }

        let mut swapped = 0;
        while self.resident_bytes() > self.memory_limit {
            let victim = self.residency.lock().pop_lru();
            let Some((index, ())) = victim else {
                break;
            };

            match self.swap_out_tile(index) {
                Ok(true) => swapped += 1,
                Ok(false) => {}
                Err(e) => {
                    self.touch(index);
                    warn!(error = %e, ?index, swapped, "Stopped swapping under memory pressure");
                    return Err(e);
                }
            }
        }

        if swapped > 0 {
            debug!(swapped, resident = self.resident_bytes(), "Enforced memory limit");
        }
        Ok(swapped)
    }
}

impl Drop for TiledDataManager {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            warn!(error = %e, "Failed to release tiles");
        }
    }
}
