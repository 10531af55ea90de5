//! Derived geometry and thumbnails of one paint device
//!
//! Three [`LockFreeCache`]s keyed by wrap-around mode hold exact bounds,
//! non-default pixel area and covered region. Thumbnails live in a
//! separate map behind their own read/write lock. [`PaintDeviceCache::invalidate`]
//! drops all of it and bumps the sequence number.

use super::lock_free::LockFreeCache;
use crate::device::{Rect, Region};
use image::RgbaImage;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Colour conversion intent requested for a thumbnail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderingIntent {
    #[default]
    Perceptual,
    RelativeColorimetric,
    Saturation,
    AbsoluteColorimetric,
}

bitflags::bitflags! {
    /// Colour conversion options requested for a thumbnail
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct ConversionFlags : u8 {
        const BLACKPOINT_COMPENSATION = 0b0000_0001;
        const NO_OPTIMIZATION         = 0b0000_0010;
        const NO_WHITE_ON_WHITE_FIXUP = 0b0000_0100;
    }
}

/// What the cache needs from the device it serves
///
/// Every method receives the mode to compute for, so a result can never
/// be filed under a mode it was not computed with.
pub trait PaintDeviceSource: Send + Sync {
    /// Current wrap-around mode, used as the cache key
    fn wrap_around_mode(&self) -> bool;

    /// Scan pixel content; with `non_default_only` only pixels that differ
    /// from the default pixel count
    fn calculate_exact_bounds(&self, non_default_only: bool, wrap_around: bool) -> Rect;

    /// Cheap tile-aligned bounds, possibly too large
    fn extent(&self) -> Rect;

    /// Tile-aligned covered area
    fn region(&self, wrap_around: bool) -> Region;

    /// Render `rect` into a `width` x `height` image
    fn render_thumbnail(
        &self,
        width: u32,
        height: u32,
        rect: Rect,
        oversample: f64,
        intent: RenderingIntent,
        flags: ConversionFlags,
    ) -> RgbaImage;
}

type ThumbnailMap = HashMap<(u32, u32), HashMap<u64, Arc<RgbaImage>>>;

/// Per-device facade over the geometry caches and the thumbnail cache
pub struct PaintDeviceCache {
    source: Arc<dyn PaintDeviceSource>,
    exact_bounds: LockFreeCache<Rect>,
    non_default_pixel_area: LockFreeCache<Rect>,
    region: LockFreeCache<Region>,
    thumbnails: RwLock<ThumbnailMap>,
    sequence_number: AtomicU64,
}

impl PaintDeviceCache {
    pub fn new(source: Arc<dyn PaintDeviceSource>) -> Self {
        let exact = source.clone();
        let non_default = source.clone();
        let region = source.clone();

        Self {
            exact_bounds: LockFreeCache::new(move |wrap: &bool| {
                exact.calculate_exact_bounds(false, *wrap)
            }),
            non_default_pixel_area: LockFreeCache::new(move |wrap: &bool| {
                non_default.calculate_exact_bounds(true, *wrap)
            }),
            region: LockFreeCache::new(move |wrap: &bool| region.region(*wrap)),
            source,
            thumbnails: RwLock::new(HashMap::new()),
            sequence_number: AtomicU64::new(0),
        }
    }

    /// Drop every cached value; call after any pixel mutation
    pub fn invalidate(&self) {
        self.exact_bounds.invalidate();
        self.non_default_pixel_area.invalidate();
        self.region.invalidate();

        let mut thumbnails = self.thumbnails.write();
        thumbnails.clear();
        self.sequence_number.fetch_add(1, Ordering::AcqRel);
    }

    /// Exact bounds of the pixel content
    pub fn exact_bounds(&self) -> Rect {
        self.exact_bounds.get_value(&self.source.wrap_around_mode())
    }

    /// Exact bounds if already known, otherwise the extent
    ///
    /// Never triggers a pixel scan.
    pub fn exact_bounds_amortized(&self) -> Rect {
        match self
            .exact_bounds
            .try_get_value(&self.source.wrap_around_mode())
        {
            Some(bounds) => bounds,
            None => self.source.extent(),
        }
    }

    /// Bounds of the pixels that differ from the default pixel
    pub fn non_default_pixel_area(&self) -> Rect {
        self.non_default_pixel_area
            .get_value(&self.source.wrap_around_mode())
    }

    pub fn region(&self) -> Region {
        self.region.get_value(&self.source.wrap_around_mode())
    }

    /// Thumbnail of the exact bounds, cached per `(width, height, oversample)`
    ///
    /// A zero dimension yields an empty image without rendering.
    pub fn create_thumbnail(
        &self,
        width: u32,
        height: u32,
        oversample: f64,
        intent: RenderingIntent,
        flags: ConversionFlags,
    ) -> Arc<RgbaImage> {
        if width == 0 || height == 0 {
            return Arc::new(RgbaImage::new(0, 0));
        }

        let size = (width, height);
        let oversample_key = oversample.to_bits();

        if let Some(thumbnail) = Self::lookup(&self.thumbnails.read(), size, oversample_key) {
            return thumbnail;
        }

        let sequence = self.sequence_number();
        let bounds = self.exact_bounds();
        let thumbnail = Arc::new(self.source.render_thumbnail(
            width, height, bounds, oversample, intent, flags,
        ));

        let mut thumbnails = self.thumbnails.write();
        if let Some(existing) = Self::lookup(&thumbnails, size, oversample_key) {
            return existing;
        }
        if self.sequence_number() == sequence {
            thumbnails
                .entry(size)
                .or_default()
                .insert(oversample_key, thumbnail.clone());
            debug!(width, height, oversample, "Cached thumbnail");
        }
        thumbnail
    }

    fn lookup(
        thumbnails: &ThumbnailMap,
        size: (u32, u32),
        oversample: u64,
    ) -> Option<Arc<RgbaImage>> {
        thumbnails
            .get(&size)
            .and_then(|by_oversample| by_oversample.get(&oversample))
            .cloned()
    }

    /// Number of cached thumbnails
    pub fn thumbnail_count(&self) -> usize {
        self.thumbnails.read().values().map(HashMap::len).sum()
    }

    /// Counter bumped by every [`Self::invalidate`]
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeDevice {
        wrap: std::sync::atomic::AtomicBool,
        scans: AtomicUsize,
        renders: AtomicUsize,
    }

    impl PaintDeviceSource for FakeDevice {
        fn wrap_around_mode(&self) -> bool {
            self.wrap.load(Ordering::SeqCst)
        }

        fn calculate_exact_bounds(&self, non_default_only: bool, wrap_around: bool) -> Rect {
            self.scans.fetch_add(1, Ordering::SeqCst);
            let size = if wrap_around { 10 } else { 20 };
            let inset = if non_default_only { 1 } else { 0 };
            Rect::new(inset, inset, size, size)
        }

        fn extent(&self) -> Rect {
            Rect::new(0, 0, 64, 64)
        }

        fn region(&self, _wrap_around: bool) -> Region {
            Region::from_rects(vec![self.extent()])
        }

        fn render_thumbnail(
            &self,
            width: u32,
            height: u32,
            _rect: Rect,
            _oversample: f64,
            _intent: RenderingIntent,
            _flags: ConversionFlags,
        ) -> RgbaImage {
            self.renders.fetch_add(1, Ordering::SeqCst);
            RgbaImage::new(width, height)
        }
    }

    fn cache() -> (Arc<FakeDevice>, PaintDeviceCache) {
        let device = Arc::new(FakeDevice::default());
        let cache = PaintDeviceCache::new(device.clone());
        (device, cache)
    }

    #[test]
    fn test_amortized_falls_back_to_extent() {
        let (device, cache) = cache();

        assert_eq!(cache.exact_bounds_amortized(), Rect::new(0, 0, 64, 64));
        assert_eq!(device.scans.load(Ordering::SeqCst), 0);

        assert_eq!(cache.exact_bounds(), Rect::new(0, 0, 20, 20));
        assert_eq!(cache.exact_bounds_amortized(), Rect::new(0, 0, 20, 20));
        assert_eq!(device.scans.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_geometry_follows_wrap_mode() {
        let (device, cache) = cache();

        assert_eq!(cache.non_default_pixel_area(), Rect::new(1, 1, 20, 20));
        device.wrap.store(true, Ordering::SeqCst);
        assert_eq!(cache.non_default_pixel_area(), Rect::new(1, 1, 10, 10));
        device.wrap.store(false, Ordering::SeqCst);
        assert_eq!(cache.non_default_pixel_area(), Rect::new(1, 1, 20, 20));
        assert_eq!(device.scans.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_thumbnail_keys_are_exact() {
        let (device, cache) = cache();
        let (intent, flags) = (RenderingIntent::default(), ConversionFlags::empty());

        let a = cache.create_thumbnail(8, 4, 1.0, intent, flags);
        let b = cache.create_thumbnail(4, 8, 1.0, intent, flags);
        let c = cache.create_thumbnail(8, 4, 2.0, intent, flags);
        let again = cache.create_thumbnail(8, 4, 1.0, intent, flags);

        assert_eq!(a.dimensions(), (8, 4));
        assert_eq!(b.dimensions(), (4, 8));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(device.renders.load(Ordering::SeqCst), 3);
        assert_eq!(cache.thumbnail_count(), 3);
    }

    #[test]
    fn test_zero_sized_thumbnail_skips_render() {
        let (device, cache) = cache();
        let (intent, flags) = (RenderingIntent::Saturation, ConversionFlags::all());
        let image = cache.create_thumbnail(0, 10, 1.0, intent, flags);
        assert_eq!(image.dimensions(), (0, 0));
        assert_eq!(device.renders.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalidate_clears_everything() {
        let (device, cache) = cache();
        let (intent, flags) = (RenderingIntent::default(), ConversionFlags::empty());

        cache.exact_bounds();
        cache.region();
        cache.create_thumbnail(2, 2, 1.0, intent, flags);
        assert_eq!(cache.sequence_number(), 0);

        cache.invalidate();
        assert_eq!(cache.sequence_number(), 1);
        assert_eq!(cache.thumbnail_count(), 0);
        assert_eq!(cache.exact_bounds_amortized(), device.extent());

        cache.exact_bounds();
        cache.create_thumbnail(2, 2, 1.0, intent, flags);
        assert_eq!(cache.sequence_number(), 1);
        assert_eq!(device.renders.load(Ordering::SeqCst), 2);
    }
}
