//! Paint device
//!
//! A [`PaintDevice`] is a tile grid plus the information needed to
//! interpret it: default bounds, wrap-around mode and the default pixel.
//! Derived geometry and thumbnails are served through a
//! [`PaintDeviceCache`] that every mutation invalidates.

use super::geometry::{Rect, Region};
use crate::cache::{ConversionFlags, PaintDeviceCache, PaintDeviceSource, RenderingIntent};
use crate::config::ImageConfig;
use crate::error::Result;
use crate::swap::SwappedDataStore;
use crate::tiles::{PixelFormat, TiledDataManager};
use image::{Rgba, RgbaImage};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on samples per thumbnail pixel along each axis
const MAX_OVERSAMPLE: u64 = 16;

/// Image bounds and wrap-around mode of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DefaultBounds {
    pub bounds: Rect,
    /// Pixels repeat outside `bounds`
    pub wrap_around: bool,
}

struct DeviceContent {
    data: TiledDataManager,
    default_bounds: RwLock<DefaultBounds>,
}

impl DeviceContent {
    fn clip(&self, rect: Rect, wrap_around: bool) -> Rect {
        if wrap_around {
            rect.intersected(&self.default_bounds.read().bounds)
        } else {
            rect
        }
    }

    fn wrap_point(&self, x: i32, y: i32) -> (i32, i32) {
        let DefaultBounds {
            bounds,
            wrap_around,
        } = *self.default_bounds.read();
        if !wrap_around || bounds.is_empty() {
            return (x, y);
        }
        (
            bounds.x + (x - bounds.x).rem_euclid(bounds.width),
            bounds.y + (y - bounds.y).rem_euclid(bounds.height),
        )
    }

    fn sample(&self, x: i32, y: i32, fallback: &[u8], failed: &mut bool) -> [u8; 4] {
        let (x, y) = self.wrap_point(x, y);
        let format = self.data.format();
        match self.data.read_pixel(x, y) {
            Ok(pixel) => format.to_rgba8(&pixel),
            Err(e) => {
                if !*failed {
                    warn!(error = %e, x, y, "Thumbnail read failed, using default pixel");
                    *failed = true;
                }
                format.to_rgba8(fallback)
            }
        }
    }
}

impl PaintDeviceSource for DeviceContent {
    fn wrap_around_mode(&self) -> bool {
        self.default_bounds.read().wrap_around
    }

    fn calculate_exact_bounds(&self, non_default_only: bool, wrap_around: bool) -> Rect {
        let mut area = match self.data.non_default_bounds() {
            Ok(area) => area,
            Err(e) => {
                warn!(error = %e, "Exact bounds scan failed, using extent");
                self.data.extent()
            }
        };

        let default_pixel = self.data.default_pixel();
        if !non_default_only && !self.data.format().is_transparent(&default_pixel) {
            area = area.united(&self.default_bounds.read().bounds);
        }
        self.clip(area, wrap_around)
    }

    fn extent(&self) -> Rect {
        self.clip(self.data.extent(), self.wrap_around_mode())
    }

    fn region(&self, wrap_around: bool) -> Region {
        let region = self.data.region();
        if wrap_around {
            region.intersected(&self.default_bounds.read().bounds)
        } else {
            region
        }
    }

    fn render_thumbnail(
        &self,
        width: u32,
        height: u32,
        rect: Rect,
        oversample: f64,
        intent: RenderingIntent,
        flags: ConversionFlags,
    ) -> RgbaImage {
        if rect.is_empty() {
            return RgbaImage::new(width, height);
        }

        let width = width.min(rect.width as u32);
        let height = height.min(rect.height as u32);
        let samples = (oversample.round() as u64).clamp(1, MAX_OVERSAMPLE);
        let (columns, rows) = ((width as u64 * samples) as f64, (height as u64 * samples) as f64);
        let fallback = self.data.default_pixel();
        let mut failed = false;

        debug!(width, height, ?rect, samples, ?intent, ?flags, "Rendering thumbnail");

        RgbaImage::from_fn(width, height, |ox, oy| {
            let mut sum = [0u64; 4];
            for sy in 0..samples {
                for sx in 0..samples {
                    let u = (ox as u64 * samples + sx) as f64 + 0.5;
                    let v = (oy as u64 * samples + sy) as f64 + 0.5;
                    let x = rect.x + (u * rect.width as f64 / columns) as i32;
                    let y = rect.y + (v * rect.height as f64 / rows) as i32;
                    let rgba = self.sample(x, y, &fallback, &mut failed);
                    for (acc, c) in sum.iter_mut().zip(rgba) {
                        *acc += c as u64;
                    }
                }
            }
            let count = samples * samples;
            Rgba(sum.map(|acc| ((acc + count / 2) / count) as u8))
        })
    }
}

/// A tiled raster with cached derived geometry
pub struct PaintDevice {
    content: Arc<DeviceContent>,
    cache: PaintDeviceCache,
}

impl PaintDevice {
    /// In-memory device without swap
    pub fn new(tile_size: u32, format: PixelFormat, default_pixel: &[u8]) -> Result<Self> {
        Ok(Self::from_data(TiledDataManager::new(
            tile_size,
            format,
            default_pixel,
        )?))
    }

    /// Device whose tiles may be swapped to `store` once resident tile
    /// bytes exceed `config.memory_limit`
    pub fn with_swap(
        config: &ImageConfig,
        format: PixelFormat,
        default_pixel: &[u8],
        store: Arc<SwappedDataStore>,
    ) -> Result<Self> {
        let data = TiledDataManager::new(config.tile_size, format, default_pixel)?
            .with_swap(store, config.memory_limit);
        Ok(Self::from_data(data))
    }

    fn from_data(data: TiledDataManager) -> Self {
        let content = Arc::new(DeviceContent {
            data,
            default_bounds: RwLock::new(DefaultBounds::default()),
        });
        let cache = PaintDeviceCache::new(content.clone());
        cache.invalidate();
        Self { content, cache }
    }

    pub fn format(&self) -> PixelFormat {
        self.content.data.format()
    }

    /// The underlying tile grid
    pub fn data_manager(&self) -> &TiledDataManager {
        &self.content.data
    }

    pub fn default_bounds(&self) -> DefaultBounds {
        *self.content.default_bounds.read()
    }

    pub fn set_default_bounds(&self, bounds: DefaultBounds) {
        *self.content.default_bounds.write() = bounds;
        self.cache.invalidate();
    }

    pub fn default_pixel(&self) -> Vec<u8> {
        self.content.data.default_pixel()
    }

    pub fn set_default_pixel(&self, pixel: &[u8]) -> Result<()> {
        self.content.data.set_default_pixel(pixel)?;
        self.cache.invalidate();
        Ok(())
    }

    /// Read one pixel; in wrap-around mode coordinates repeat over the bounds
    pub fn pixel(&self, x: i32, y: i32) -> Result<Vec<u8>> {
        let (x, y) = self.content.wrap_point(x, y);
        self.content.data.read_pixel(x, y)
    }

    pub fn set_pixel(&self, x: i32, y: i32, pixel: &[u8]) -> Result<()> {
        let (x, y) = self.content.wrap_point(x, y);
        let result = self.content.data.write_pixel(x, y, pixel);
        self.cache.invalidate();
        result
    }

    pub fn fill(&self, rect: Rect, pixel: &[u8]) -> Result<()> {
        let result = self.content.data.fill_rect(rect, pixel);
        self.cache.invalidate();
        result
    }

    /// Remove all tiles
    pub fn clear(&self) -> Result<()> {
        let result = self.content.data.clear();
        self.cache.invalidate();
        result
    }

    /// Swap out cold tiles until the memory limit holds
    ///
    /// Pixel content is unchanged, so cached geometry stays valid.
    pub fn enforce_memory_limit(&self) -> Result<usize> {
        self.content.data.enforce_memory_limit()
    }

    /// Drop cached geometry and thumbnails
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    pub fn cache(&self) -> &PaintDeviceCache {
        &self.cache
    }

    pub fn extent(&self) -> Rect {
        self.content.extent()
    }

    pub fn exact_bounds(&self) -> Rect {
        self.cache.exact_bounds()
    }

    pub fn exact_bounds_amortized(&self) -> Rect {
        self.cache.exact_bounds_amortized()
    }

    pub fn non_default_pixel_area(&self) -> Rect {
        self.cache.non_default_pixel_area()
    }

    pub fn region(&self) -> Region {
        self.cache.region()
    }

    pub fn create_thumbnail(
        &self,
        width: u32,
        height: u32,
        oversample: f64,
        intent: RenderingIntent,
        flags: ConversionFlags,
    ) -> Arc<RgbaImage> {
        self.cache
            .create_thumbnail(width, height, oversample, intent, flags)
    }

    pub fn sequence_number(&self) -> u64 {
        self.cache.sequence_number()
    }
}
