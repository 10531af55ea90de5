//! Caches of derived paint device state

pub mod lock_free;
pub mod paint_device_cache;

pub use lock_free::LockFreeCache;
pub use paint_device_cache::{
    ConversionFlags, PaintDeviceCache, PaintDeviceSource, RenderingIntent,
};
