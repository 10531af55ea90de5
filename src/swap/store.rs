//! Swapped data store
//!
//! Combines ChunkAllocator + MemoryWindow + TileDataCompressor behind a
//! single store-wide lock. This is the layer the tile grid talks to.
//!
//! # Locking
//!
//! Callers pass `&mut TileData`, which they can only obtain while holding
//! the tile's own mutex. The store lock on top of that serialises use of
//! the shared scratch buffer, window and allocator across different tiles.
//! It is held for one tile transition at a time, I/O included.

use super::allocator::ChunkAllocator;
use super::chunk::Chunk;
use super::compression::{CompressionStats, TileDataCompressor};
use super::memory_window::MemoryWindow;
use crate::config::ImageConfig;
use crate::error::{Error, Result};
use crate::tiles::TileData;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

struct SwapSpace {
    window: MemoryWindow,
    compressor: TileDataCompressor,
    buffer: Vec<u8>,
}

/// Moves tile pixel buffers between memory and the swap file
pub struct SwappedDataStore {
    space: Mutex<SwapSpace>,
    allocator: ChunkAllocator,
    total_swap_memory_used: AtomicU64,
    swap_out_failures: AtomicU64,
}

impl SwappedDataStore {
    /// Create the store and its swap file from the image settings
    pub fn new(config: &ImageConfig) -> Result<Self> {
        config.validate()?;

        let allocator = ChunkAllocator::new(config.swap_slab_size, config.max_swap_size)?;
        let window = MemoryWindow::new(&config.swap_dir, config.swap_window_size)?;

        info!(
            max_swap_size = config.max_swap_size,
            slab_size = config.swap_slab_size,
            window_size = config.swap_window_size,
            "Swapped data store ready"
        );

        Ok(Self {
            space: Mutex::new(SwapSpace {
                window,
                compressor: TileDataCompressor::new(config.compression_level),
                buffer: Vec::new(),
            }),
            allocator,
            total_swap_memory_used: AtomicU64::new(0),
            swap_out_failures: AtomicU64::new(0),
        })
    }

    /// Number of tiles currently held in swap
    ///
    /// Does not take the store lock.
    pub fn num_tiles(&self) -> u64 {
        self.allocator.num_chunks()
    }

    /// Compress `td` into the swap file and drop its memory buffer
    ///
    /// `td` must be resident. On any failure the tile stays resident and
    /// untouched, so the caller may keep using it or retry later.
    pub fn try_swap_out_tile_data(&self, td: &mut TileData) -> Result<()> {
        if !td.is_resident() {
            return Err(Error::InvalidState(format!(
                "cannot swap out tile data in state {:?}",
                td.state()
            )));
        }

        let result = self.swap_out_locked(td);
        match &result {
            Ok(chunk) => {
                metrics::counter!("tilevault_swap_out_total").increment(1);
                debug!(%chunk, raw = td.buffer_size(), "Swapped out tile");
            }
            Err(e) => {
                self.swap_out_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("tilevault_swap_out_failures_total").increment(1);
                warn!(error = %e, "Swap out of tile failed");
            }
        }
        result.map(|_| ())
    }

    fn swap_out_locked(&self, td: &mut TileData) -> Result<Chunk> {
        let mut guard = self.space.lock();
        let SwapSpace {
            window,
            compressor,
            buffer,
        } = &mut *guard;

        let expected = compressor.tile_data_buffer_size(td);
        if buffer.len() < expected {
            buffer.resize(expected, 0);
        }

        let written = compressor.compress_tile_data(td, buffer)?;
        let chunk = self.allocator.get_chunk(written as u32)?;

        match window.get_write_chunk(chunk) {
            Ok(dest) => dest.copy_from_slice(&buffer[..written]),
            Err(e) => {
                if let Err(free_err) = self.allocator.free_chunk(chunk) {
                    warn!(error = %free_err, %chunk, "Could not release chunk of failed swap out");
                }
                return Err(e);
            }
        }

        td.set_swapped(chunk);
        let total = self
            .total_swap_memory_used
            .fetch_add(chunk.size as u64, Ordering::Relaxed)
            + chunk.size as u64;
        metrics::gauge!("tilevault_swap_bytes").set(total as f64);

        Ok(chunk)
    }

    /// Read `td` back from the swap file into a fresh memory buffer
    ///
    /// `td` must be swapped. If its bytes cannot be read or decoded the
    /// error is returned and `td` keeps its chunk, so it can still be
    /// forgotten. Once the pixels are back, failing to release the chunk
    /// is only logged: the tile is resident and no longer owns it.
    pub fn swap_in_tile_data(&self, td: &mut TileData) -> Result<()> {
        let chunk = td
            .swap_chunk()
            .filter(|c| !c.is_null())
            .ok_or(Error::MissingSwapChunk)?;

        let mut guard = self.space.lock();
        let SwapSpace {
            window, compressor, ..
        } = &mut *guard;

        let src = window.get_read_chunk(chunk)?;
        compressor.decompress_tile_data(src, td)?;

        if let Err(e) = self.release(chunk) {
            warn!(error = %e, %chunk, "Could not release chunk of swapped in tile");
        }
        metrics::counter!("tilevault_swap_in_total").increment(1);
        debug!(%chunk, "Swapped in tile");
        Ok(())
    }

    /// Drop the swapped bytes of a tile that is being destroyed
    ///
    /// Nothing is decompressed. `td` ends up forgotten whatever state it
    /// was in.
    pub fn forget_tile_data(&self, td: &mut TileData) -> Result<()> {
        let released = match td.swap_chunk() {
            Some(chunk) => {
                let _guard = self.space.lock();
                let released = self.release(chunk);
                debug!(%chunk, "Forgot swapped tile");
                released
            }
            None => Ok(()),
        };
        td.set_forgotten();
        released
    }

    /// Return `chunk` to the allocator and drop it from the usage total
    ///
    /// The total is adjusted even when the allocator refuses the chunk,
    /// since no tile refers to it afterwards.
    fn release(&self, chunk: Chunk) -> Result<()> {
        let freed = self.allocator.free_chunk(chunk);
        let total = self
            .total_swap_memory_used
            .fetch_sub(chunk.size as u64, Ordering::Relaxed)
            .saturating_sub(chunk.size as u64);
        metrics::gauge!("tilevault_swap_bytes").set(total as f64);
        freed
    }

    /// Bytes of compressed tile data currently in swap
    ///
    /// Does not take the store lock.
    pub fn total_swap_memory_used(&self) -> u64 {
        self.total_swap_memory_used.load(Ordering::Relaxed)
    }

    /// Check allocator consistency and log its fragmentation
    pub fn debug_statistics(&self) -> Result<()> {
        let _guard = self.space.lock();
        self.allocator.sanity_check()?;
        self.allocator.debug_fragmentation();
        Ok(())
    }

    /// Snapshot of swap usage
    pub fn stats(&self) -> SwapStats {
        let guard = self.space.lock();
        let slabs = self.allocator.fragmentation();
        SwapStats {
            tiles: self.allocator.num_chunks(),
            swap_memory_used: self.total_swap_memory_used(),
            reserved_bytes: self.allocator.reserved_bytes(),
            file_len: guard.window.file_len(),
            slabs: slabs.len(),
            free_ranges: slabs.iter().map(|s| s.free_ranges).sum(),
            swap_out_failures: self.swap_out_failures.load(Ordering::Relaxed),
        }
    }
}

/// Swap usage snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapStats {
    pub tiles: u64,
    pub swap_memory_used: u64,
    pub reserved_bytes: u64,
    pub file_len: u64,
    pub slabs: usize,
    pub free_ranges: usize,
    /// Swap outs that failed since the store was created
    pub swap_out_failures: u64,
}

impl SwapStats {
    /// Compression achieved by the tiles in swap, all of `tile_bytes` raw
    pub fn compression(&self, tile_bytes: u64) -> CompressionStats {
        CompressionStats::for_tiles(self.tiles, tile_bytes, self.swap_memory_used)
    }
}
