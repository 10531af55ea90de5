//! Paint devices and their geometry

pub mod geometry;
pub mod paint_device;

pub use geometry::{Rect, Region};
pub use paint_device::{DefaultBounds, PaintDevice};
