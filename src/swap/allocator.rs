//! Chunk allocator over a virtual swap address space

use super::chunk::Chunk;
use super::slab::Slab;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Allocates byte ranges inside the swap address space
///
/// The address space is reserved slab by slab. Slabs are laid out back to
/// back starting at offset zero, so the swap file only ever needs to be as
/// long as the last slab that was touched. Nothing here maps or touches the
/// file itself.
pub struct ChunkAllocator {
    slab_size: u64,
    max_size: u64,
    /// Slabs sorted by base offset
    slabs: Mutex<Vec<Slab>>,
    live_chunks: AtomicU64,
    used_bytes: AtomicU64,
}

impl ChunkAllocator {
    /// Create an allocator
    ///
    /// # Arguments
    /// * `slab_size` - Size of a freshly reserved slab
    /// * `max_size` - Upper bound on the total reserved swap space
    pub fn new(slab_size: u64, max_size: u64) -> Result<Self> {
        if slab_size == 0 || max_size == 0 {
            return Err(Error::InvalidArgument(
                "slab size and maximum swap size must be non-zero".to_string(),
            ));
        }

        info!(slab_size, max_size, "Initializing chunk allocator");

        Ok(Self {
            slab_size,
            max_size,
            slabs: Mutex::new(Vec::new()),
            live_chunks: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
        })
    }

    /// Allocate a chunk of `size` bytes
    ///
    /// Existing slabs are searched first-fit. A new slab is reserved only
    /// when none of them has a large enough free range.
    pub fn get_chunk(&self, size: u32) -> Result<Chunk> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "cannot allocate an empty chunk".to_string(),
            ));
        }

        let mut slabs = self.slabs.lock();

        for slab in slabs.iter_mut() {
            if let Some(offset) = slab.allocate(size) {
                return Ok(self.account_new(Chunk::new(offset, size)));
            }
        }

        let reserved = slabs.last().map(Slab::end).unwrap_or(0);
        let remaining = self.max_size.saturating_sub(reserved);
        let wanted = (size as u64).div_ceil(self.slab_size) * self.slab_size;
        let slab_len = wanted.min(remaining);

        if slab_len < size as u64 {
            return Err(Error::SwapExhausted {
                requested: size as u64,
                max: self.max_size,
            });
        }

        debug!(base = reserved, size = slab_len, "Reserving new swap slab");
        let mut slab = Slab::new(reserved, slab_len);
        let offset = slab
            .allocate(size)
            .ok_or_else(|| Error::InvalidState("fresh slab cannot fit chunk".to_string()))?;
        slabs.push(slab);

        Ok(self.account_new(Chunk::new(offset, size)))
    }

    fn account_new(&self, chunk: Chunk) -> Chunk {
        self.live_chunks.fetch_add(1, Ordering::Relaxed);
        self.used_bytes.fetch_add(chunk.size as u64, Ordering::Relaxed);
        debug!(%chunk, "Allocated chunk");
        chunk
    }

    /// Return a chunk to the slab it came from
    ///
    /// Freeing the null chunk is a no-op.
    pub fn free_chunk(&self, chunk: Chunk) -> Result<()> {
        if chunk.is_null() {
            return Ok(());
        }

        let mut slabs = self.slabs.lock();
        let index = slabs.partition_point(|s| s.end() <= chunk.offset);
        let slab = slabs
            .get_mut(index)
            .filter(|s| s.contains(chunk.offset))
            .ok_or_else(|| {
                Error::InvalidState(format!("{} does not belong to any slab", chunk))
            })?;

        slab.free(chunk.offset, chunk.size)?;

        self.live_chunks.fetch_sub(1, Ordering::Relaxed);
        self.used_bytes.fetch_sub(chunk.size as u64, Ordering::Relaxed);
        debug!(%chunk, "Freed chunk");
        Ok(())
    }

    /// Number of live chunks
    ///
    /// Lock free; may be stale by the time it is read.
    pub fn num_chunks(&self) -> u64 {
        self.live_chunks.load(Ordering::Relaxed)
    }

    /// Bytes held by live chunks
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// Bytes of swap address space reserved by slabs
    pub fn reserved_bytes(&self) -> u64 {
        self.slabs.lock().last().map(Slab::end).unwrap_or(0)
    }

    /// Configured maximum swap size
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Per-slab free/used breakdown
    pub fn fragmentation(&self) -> Vec<SlabFragmentation> {
        self.slabs
            .lock()
            .iter()
            .map(|slab| SlabFragmentation {
                base: slab.base,
                size: slab.size,
                used_bytes: slab.used_bytes(),
                free_bytes: slab.free_bytes(),
                chunks: slab.chunk_count(),
                free_ranges: slab.free_range_count(),
                largest_free: slab.largest_free(),
            })
            .collect()
    }

    /// Log the fragmentation report
    pub fn debug_fragmentation(&self) {
        let report = self.fragmentation();
        let total_free: u64 = report.iter().map(|s| s.free_bytes).sum();
        info!(
            slabs = report.len(),
            used = self.used_bytes(),
            free = total_free,
            "Swap fragmentation"
        );
        for slab in &report {
            debug!(
                base = slab.base,
                size = slab.size,
                used = slab.used_bytes,
                free = slab.free_bytes,
                chunks = slab.chunks,
                free_ranges = slab.free_ranges,
                largest_free = slab.largest_free,
                "Slab"
            );
        }
    }

    /// Check internal consistency
    ///
    /// Verifies that every slab is exactly tiled by live and free ranges,
    /// that slabs are contiguous, and that the lock-free counters agree with
    /// the slabs.
    pub fn sanity_check(&self) -> Result<()> {
        let slabs = self.slabs.lock();

        let mut cursor = 0u64;
        let mut chunks = 0u64;
        let mut used = 0u64;
        for slab in slabs.iter() {
            if slab.base != cursor {
                return Err(Error::InvalidState(format!(
                    "slab at {} expected at {}",
                    slab.base, cursor
                )));
            }
            slab.check()?;
            cursor = slab.end();
            chunks += slab.chunk_count() as u64;
            used += slab.used_bytes();
        }

        if cursor > self.max_size {
            return Err(Error::InvalidState(format!(
                "reserved {} bytes beyond maximum {}",
                cursor, self.max_size
            )));
        }
        if chunks != self.num_chunks() || used != self.used_bytes() {
            return Err(Error::InvalidState(format!(
                "counters ({} chunks, {} bytes) disagree with slabs ({} chunks, {} bytes)",
                self.num_chunks(),
                self.used_bytes(),
                chunks,
                used
            )));
        }

        Ok(())
    }
}

/// Fragmentation report for one slab
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabFragmentation {
    pub base: u64,
    pub size: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub chunks: usize,
    pub free_ranges: usize,
    pub largest_free: u64,
}
