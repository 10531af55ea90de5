//! Chunk descriptors for the swap address space

use std::fmt;

/// A byte range inside the swap address space
///
/// A chunk with `size == 0` is the null chunk: it owns nothing and
/// freeing it is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk {
    /// Offset of the first byte in the swap space
    pub offset: u64,
    /// Length in bytes
    pub size: u32,
}

impl Chunk {
    /// The null chunk
    pub const NULL: Chunk = Chunk { offset: 0, size: 0 };

    /// Create a new chunk descriptor
    pub fn new(offset: u64, size: u32) -> Self {
        Self { offset, size }
    }

    /// Whether this is the null chunk
    pub fn is_null(&self) -> bool {
        self.size == 0
    }

    /// One past the last byte of the chunk
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    /// Whether two chunks share at least one byte
    pub fn overlaps(&self, other: &Chunk) -> bool {
        !self.is_null()
            && !other.is_null()
            && self.offset < other.end()
            && other.offset < self.end()
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Chunk(null)")
        } else {
            write!(f, "Chunk(offset={}, size={})", self.offset, self.size)
        }
    }
}
