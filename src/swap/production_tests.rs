//! Stress tests for the swap layer
//!
//! These tests drive the store the way the tile grid does: many tiles,
//! interleaved swap traffic, several threads.

#[cfg(test)]
mod integration {
    use crate::config::ImageConfig;
    use crate::swap::{Chunk, ChunkAllocator, SwappedDataStore};
    use crate::tiles::{PixelFormat, TileData};
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn store_in(dir: &std::path::Path) -> crate::error::Result<SwappedDataStore> {
        SwappedDataStore::new(&ImageConfig {
            max_swap_size: 64 * 1024 * 1024,
            swap_slab_size: 256 * 1024,
            swap_window_size: 64 * 1024,
            swap_dir: dir.to_path_buf(),
            ..ImageConfig::default()
        })
    }

    fn random_tile(rng: &mut StdRng, format: PixelFormat) -> crate::error::Result<TileData> {
        // Mix flat runs with noise so chunk sizes vary
        let size = 64 * 64 * format.pixel_size();
        let split = rng.gen_range(0..size);
        let fill: u8 = rng.gen();
        let buffer: Vec<u8> = (0..size)
            .map(|i| if i < split { fill } else { rng.gen() })
            .collect();
        TileData::new(64, format, Arc::new(buffer))
    }

    #[test]
    fn test_production_many_tiles() -> crate::error::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path())?;
        let mut rng = StdRng::seed_from_u64(2024);

        let mut tiles = Vec::new();
        for i in 0..200 {
            let format = PixelFormat::ALL[i % PixelFormat::ALL.len()];
            let td = random_tile(&mut rng, format)?;
            let original = td.data().unwrap().to_vec();
            tiles.push((td, original));
        }

        for (td, _) in tiles.iter_mut() {
            store.try_swap_out_tile_data(td)?;
        }
        assert_eq!(store.num_tiles(), 200);

        // Bring back every other tile, forget the rest
        for (i, (td, original)) in tiles.iter_mut().enumerate() {
            if i % 2 == 0 {
                store.swap_in_tile_data(td)?;
                assert_eq!(td.data().unwrap(), &original[..]);
            } else {
                store.forget_tile_data(td)?;
            }
        }

        assert_eq!(store.num_tiles(), 0);
        assert_eq!(store.total_swap_memory_used(), 0);
        store.debug_statistics()?;

        Ok(())
    }

    #[test]
    fn test_production_allocator_churn() -> crate::error::Result<()> {
        let allocator = ChunkAllocator::new(8192, 4 * 1024 * 1024)?;
        let mut rng = StdRng::seed_from_u64(17);
        let mut live: Vec<Chunk> = Vec::new();

        for _ in 0..5000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..6000);
                if let Ok(chunk) = allocator.get_chunk(size) {
                    live.push(chunk);
                }
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                allocator.free_chunk(victim)?;
            }
        }

        // No two live chunks overlap
        let mut sorted = live.clone();
        sorted.sort();
        for pair in sorted.windows(2) {
            assert!(!pair[0].overlaps(&pair[1]), "{} overlaps {}", pair[0], pair[1]);
        }

        let live_bytes: u64 = live.iter().map(|c| c.size as u64).sum();
        assert_eq!(allocator.used_bytes(), live_bytes);
        assert!(live_bytes <= allocator.max_size());
        allocator.sanity_check()?;

        Ok(())
    }

    #[test]
    fn test_production_concurrent_swapping() -> crate::error::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(store_in(dir.path())?);

        let mut rng = StdRng::seed_from_u64(5);
        let tiles: Vec<Arc<Mutex<TileData>>> = (0..64)
            .map(|_| random_tile(&mut rng, PixelFormat::Rgba8).map(|t| Arc::new(Mutex::new(t))))
            .collect::<crate::error::Result<_>>()?;
        let originals: Vec<Vec<u8>> = tiles
            .iter()
            .map(|t| t.lock().data().unwrap().to_vec())
            .collect();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let store = &store;
                let tiles = &tiles;
                scope.spawn(move || {
                    for round in 0..10 {
                        for (i, tile) in tiles.iter().enumerate() {
                            if (i + round) % 4 != worker {
                                continue;
                            }
                            let mut td = tile.lock();
                            if td.is_resident() {
                                store.try_swap_out_tile_data(&mut td).unwrap();
                            } else {
                                store.swap_in_tile_data(&mut td).unwrap();
                            }
                        }
                    }
                });
            }
        });

        for (tile, original) in tiles.iter().zip(&originals) {
            let mut td = tile.lock();
            if td.is_swapped() {
                store.swap_in_tile_data(&mut td)?;
            }
            assert_eq!(td.data().unwrap(), &original[..]);
        }
        assert_eq!(store.total_swap_memory_used(), 0);
        store.debug_statistics()?;

        Ok(())
    }
}
