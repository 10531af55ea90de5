//! A single slab of swap address space

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// A contiguous region of swap address space subdivided into chunks
///
/// Free space is kept as a map of coalesced `offset → length` ranges.
/// Live chunks are tracked separately so that a free can be checked
/// against what was actually handed out.
#[derive(Debug)]
pub struct Slab {
    /// First byte of the slab in the swap space
    pub base: u64,
    /// Length of the slab in bytes
    pub size: u64,
    free: BTreeMap<u64, u64>,
    used: BTreeMap<u64, u32>,
    used_bytes: u64,
}

impl Slab {
    /// Create an entirely free slab
    pub fn new(base: u64, size: u64) -> Self {
        let mut free = BTreeMap::new();
        free.insert(base, size);
        Self {
            base,
            size,
            free,
            used: BTreeMap::new(),
            used_bytes: 0,
        }
    }

    /// One past the last byte of the slab
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Whether `offset` falls inside this slab
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.base && offset < self.end()
    }

    /// Carve `size` bytes out of the first free range large enough
    ///
    /// Returns the offset of the carved range.
    pub fn allocate(&mut self, size: u32) -> Option<u64> {
        let wanted = size as u64;
        let (&offset, &len) = self.free.iter().find(|(_, &len)| len >= wanted)?;

        self.free.remove(&offset);
        if len > wanted {
            self.free.insert(offset + wanted, len - wanted);
        }
        self.used.insert(offset, size);
        self.used_bytes += wanted;

        Some(offset)
    }

    /// Return a previously carved range, merging it with free neighbours
    pub fn free(&mut self, offset: u64, size: u32) -> Result<()> {
        match self.used.get(&offset) {
            Some(&live) if live == size => {}
            Some(&live) => {
                return Err(Error::InvalidState(format!(
                    "chunk at {} has size {}, tried to free {}",
                    offset, live, size
                )))
            }
            None => {
                return Err(Error::InvalidState(format!(
                    "no live chunk at offset {} in slab {}",
                    offset, self.base
                )))
            }
        }
        self.used.remove(&offset);
        self.used_bytes -= size as u64;

        let mut start = offset;
        let mut len = size as u64;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(offset + size as u64)) {
            len += next_len;
        }
        self.free.insert(start, len);

        Ok(())
    }

    /// Bytes held by live chunks
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    /// Bytes available for new chunks
    pub fn free_bytes(&self) -> u64 {
        self.size - self.used_bytes
    }

    /// Number of live chunks
    pub fn chunk_count(&self) -> usize {
        self.used.len()
    }

    /// Number of disjoint free ranges
    pub fn free_range_count(&self) -> usize {
        self.free.len()
    }

    /// Length of the largest free range
    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Verify that live and free ranges tile the slab exactly
    ///
    /// Free ranges must also be fully coalesced: two free ranges are never
    /// adjacent.
    pub fn check(&self) -> Result<()> {
        let mut ranges: Vec<(u64, u64, bool)> = self
            .used
            .iter()
            .map(|(&off, &len)| (off, len as u64, true))
            .chain(self.free.iter().map(|(&off, &len)| (off, len, false)))
            .collect();
        ranges.sort_unstable_by_key(|r| r.0);

        let mut cursor = self.base;
        let mut prev_free = false;
        for (offset, len, used) in ranges {
            if offset != cursor {
                return Err(Error::InvalidState(format!(
                    "slab {}: range at {} does not start at expected {}",
                    self.base, offset, cursor
                )));
            }
            if !used && prev_free {
                return Err(Error::InvalidState(format!(
                    "slab {}: uncoalesced free range at {}",
                    self.base, offset
                )));
            }
            prev_free = !used;
            cursor = offset + len;
        }

        if cursor != self.end() {
            return Err(Error::InvalidState(format!(
                "slab {}: ranges end at {}, slab ends at {}",
                self.base,
                cursor,
                self.end()
            )));
        }

        let used_sum: u64 = self.used.values().map(|&s| s as u64).sum();
        if used_sum != self.used_bytes {
            return Err(Error::InvalidState(format!(
                "slab {}: used accounting {} != {}",
                self.base, self.used_bytes, used_sum
            )));
        }

        Ok(())
    }
}
