// TileVault - Tiled paint device storage
// Sparse tile grids with disk swapping and lock-free derived-state caches

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod device;
pub mod swap;
pub mod tiles;

// Re-exports for convenience
pub use cache::{ConversionFlags, LockFreeCache, PaintDeviceCache, RenderingIntent};
pub use config::ImageConfig;
pub use device::{DefaultBounds, PaintDevice, Rect, Region};
pub use swap::{Chunk, ChunkAllocator, SwappedDataStore, TileDataCompressor};
pub use tiles::{PixelFormat, TileData, TiledDataManager};

/// TileVault error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Swap exhausted: requested {requested} bytes, maximum swap size is {max}")]
        SwapExhausted { requested: u64, max: u64 },

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Chunk {offset}+{size} lies beyond written swap data ({valid_len} bytes)")]
        ChunkOutOfRange { offset: u64, size: u32, valid_len: u64 },

        #[error("Tile data holds no swap chunk")]
        MissingSwapChunk,

        #[error("Corrupt swap data: {0}")]
        CorruptSwapData(String),

        #[error("Invalid state: {0}")]
        InvalidState(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(VERSION.split('.').count() >= 3);
    }

    #[test]
    fn test_error_messages() {
        let err = error::Error::SwapExhausted {
            requested: 10,
            max: 4,
        };
        assert_eq!(
            err.to_string(),
            "Swap exhausted: requested 10 bytes, maximum swap size is 4"
        );
    }
}
