//! End-to-end swapping through the public API

use std::sync::Arc;
use tilevault::device::Rect;
use tilevault::error::Error;
use tilevault::{ImageConfig, PaintDevice, PixelFormat, SwappedDataStore, TileData};

fn config_in(dir: &std::path::Path) -> ImageConfig {
    ImageConfig {
        max_swap_size: 8 * 1024 * 1024,
        swap_slab_size: 64 * 1024,
        swap_window_size: 32 * 1024,
        swap_dir: dir.to_path_buf(),
        memory_limit: 4 * 32 * 32 * 4,
        tile_size: 32,
        ..ImageConfig::default()
    }
}

#[test]
fn test_tile_data_round_trip_restores_usage() -> tilevault::error::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = SwappedDataStore::new(&config_in(dir.path()))?;

    for format in PixelFormat::ALL {
        let size = 32 * 32 * format.pixel_size();
        let buffer: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut td = TileData::new(32, format, Arc::new(buffer.clone()))?;

        let before = store.total_swap_memory_used();
        store.try_swap_out_tile_data(&mut td)?;
        assert!(td.data().is_none());

        store.swap_in_tile_data(&mut td)?;
        assert_eq!(td.data().unwrap(), &buffer[..]);
        assert_eq!(store.total_swap_memory_used(), before);
    }

    assert_eq!(store.num_tiles(), 0);
    store.debug_statistics()
}

#[test]
fn test_device_survives_memory_pressure() -> tilevault::error::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config_in(dir.path());
    let store = Arc::new(SwappedDataStore::new(&config)?);
    let device = PaintDevice::with_swap(&config, PixelFormat::Rgba8, &[0, 0, 0, 0], store.clone())?;

    for i in 0..16 {
        let rect = Rect::new(i * 32, 0, 32, 32);
        device.fill(rect, &[i as u8, 255 - i as u8, 0, 255])?;
    }
    let bounds = device.exact_bounds();

    let swapped = device.enforce_memory_limit()?;
    assert_eq!(swapped, 12);
    assert_eq!(store.num_tiles(), 12);
    assert!(device.data_manager().resident_bytes() <= config.memory_limit);

    // Swapping changes no pixels, cached geometry stays
    assert_eq!(device.exact_bounds_amortized(), bounds);

    for i in 0..16 {
        assert_eq!(device.pixel(i * 32 + 5, 7)?, vec![i as u8, 255 - i as u8, 0, 255]);
    }
    assert_eq!(store.num_tiles(), 0);
    Ok(())
}

#[test]
fn test_exhausted_swap_is_recoverable() -> tilevault::error::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = ImageConfig {
        max_swap_size: 4096,
        swap_slab_size: 4096,
        ..config_in(dir.path())
    };
    let store = Arc::new(SwappedDataStore::new(&config)?);
    let device = PaintDevice::with_swap(&config, PixelFormat::Rgba8, &[0, 0, 0, 0], store.clone())?;

    // Incompressible tiles, each larger than the whole swap space
    let mut seed = 0x2545_f491_u32;
    for i in 0..8 {
        for y in 0..32 {
            for x in 0..32 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                device.set_pixel(i * 32 + x, y, &seed.to_ne_bytes())?;
            }
        }
    }

    let before = device.data_manager().resident_bytes();
    assert!(matches!(
        device.enforce_memory_limit(),
        Err(Error::SwapExhausted { .. })
    ));
    assert_eq!(device.data_manager().resident_bytes(), before);
    assert_eq!(device.data_manager().swapped_tile_count(), 0);
    assert!(device.pixel(3, 3).is_ok());
    Ok(())
}

#[test]
fn test_dropping_device_releases_swap() -> tilevault::error::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config_in(dir.path());
    let store = Arc::new(SwappedDataStore::new(&config)?);

    {
        let device =
            PaintDevice::with_swap(&config, PixelFormat::Gray8, &[0], store.clone())?;
        device.fill(Rect::new(0, 0, 256, 64), &[200])?;
        for index in device.data_manager().tile_indices() {
            device.data_manager().swap_out_tile(index)?;
        }
        assert_eq!(store.num_tiles(), 16);
    }

    assert_eq!(store.num_tiles(), 0);
    assert_eq!(store.total_swap_memory_used(), 0);
    Ok(())
}
