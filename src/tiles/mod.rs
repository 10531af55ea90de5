//! Tiled pixel storage
//!
//! A canvas is a sparse grid of square tiles. Each tile owns a
//! [`TileData`] that is either resident in memory or parked in the swap
//! file by [`crate::swap::SwappedDataStore`].

pub mod data_manager;
pub mod pixel;
pub mod tile_data;

pub use data_manager::{TileIndex, TiledDataManager};
pub use pixel::PixelFormat;
pub use tile_data::{TileContent, TileData, TileDataState};
