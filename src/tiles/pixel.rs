//! Pixel formats

use serde::{Deserialize, Serialize};

/// The closed set of pixel layouts a tile can hold
///
/// Channels are stored interleaved in native byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Gray8,
    GrayA8,
    Rgba8,
    Rgba16,
    RgbaF32,
}

impl PixelFormat {
    /// Bytes per pixel
    pub const fn pixel_size(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::GrayA8 => 2,
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgba16 => 8,
            PixelFormat::RgbaF32 => 16,
        }
    }

    /// Convert one pixel to straight 8-bit RGBA for previews
    ///
    /// `pixel` must be exactly `pixel_size()` bytes.
    pub fn to_rgba8(self, pixel: &[u8]) -> [u8; 4] {
        match self {
            PixelFormat::Gray8 => [pixel[0], pixel[0], pixel[0], 255],
            PixelFormat::GrayA8 => [pixel[0], pixel[0], pixel[0], pixel[1]],
            PixelFormat::Rgba8 => [pixel[0], pixel[1], pixel[2], pixel[3]],
            PixelFormat::Rgba16 => {
                let mut out = [0u8; 4];
                for (c, bytes) in out.iter_mut().zip(pixel.chunks_exact(2)) {
                    *c = (u16::from_ne_bytes([bytes[0], bytes[1]]) >> 8) as u8;
                }
                out
            }
            PixelFormat::RgbaF32 => {
                let mut out = [0u8; 4];
                for (c, bytes) in out.iter_mut().zip(pixel.chunks_exact(4)) {
                    let v = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    *c = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                }
                out
            }
        }
    }

    /// Whether the pixel is fully transparent
    ///
    /// Formats without alpha are always opaque.
    pub fn is_transparent(self, pixel: &[u8]) -> bool {
        match self {
            PixelFormat::Gray8 => false,
            PixelFormat::GrayA8 => pixel[1] == 0,
            PixelFormat::Rgba8 => pixel[3] == 0,
            PixelFormat::Rgba16 => pixel[6] == 0 && pixel[7] == 0,
            PixelFormat::RgbaF32 => {
                f32::from_ne_bytes([pixel[12], pixel[13], pixel[14], pixel[15]]) <= 0.0
            }
        }
    }

    /// Every supported format
    pub const ALL: [PixelFormat; 5] = [
        PixelFormat::Gray8,
        PixelFormat::GrayA8,
        PixelFormat::Rgba8,
        PixelFormat::Rgba16,
        PixelFormat::RgbaF32,
    ];
}
