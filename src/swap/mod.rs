//! Tile swapping
//!
//! Moves cold tile pixel buffers out of memory into a single swap file
//! and back on demand.
//!
//! # Architecture
//!
//! ```text
//! SwappedDataStore (one coarse lock)
//!   ├─→ TileDataCompressor  → linearised planes + zstd
//!   ├─→ ChunkAllocator      → Slab[0] Free: {100..4096}
//!   │                       → Slab[1] Free: {}
//!   └─→ MemoryWindow        → read window / write window over the swap file
//! ```
//!
//! The allocator only hands out offsets; the window is the only part that
//! touches the file; the compressor never sees either.

pub mod allocator;
pub mod chunk;
pub mod compression;
pub mod memory_window;
pub mod production_tests;
pub mod slab;
pub mod store;

pub use allocator::{ChunkAllocator, SlabFragmentation};
pub use chunk::Chunk;
pub use compression::{CompressionAlgorithm, CompressionStats, TileDataCompressor};
pub use memory_window::MemoryWindow;
pub use slab::Slab;
pub use store::{SwapStats, SwappedDataStore};
