//! Integer rectangles and regions

use serde::{Deserialize, Serialize};

/// Axis-aligned integer rectangle; `x + width` and `y + height` are exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The empty rectangle
    pub const fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Smallest rectangle holding both; empty inputs are ignored
    pub fn united(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect::new(
            x,
            y,
            self.right().max(other.right()) - x,
            self.bottom().max(other.bottom()) - y,
        )
    }

    /// Overlap of both, or the empty rectangle
    pub fn intersected(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= x || bottom <= y {
            Rect::empty()
        } else {
            Rect::new(x, y, right - x, bottom - y)
        }
    }
}

/// A set of non-overlapping rectangles
///
/// Rectangles on the same row band that touch horizontally are merged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from rectangles that do not overlap each other
    pub fn from_rects(mut rects: Vec<Rect>) -> Self {
        rects.retain(|r| !r.is_empty());
        rects.sort_unstable_by_key(|r| (r.y, r.height, r.x));

        let mut merged: Vec<Rect> = Vec::with_capacity(rects.len());
        for rect in rects {
            match merged.last_mut() {
                Some(last)
                    if last.y == rect.y && last.height == rect.height && last.right() == rect.x =>
                {
                    last.width += rect.width;
                }
                _ => merged.push(rect),
            }
        }
        Self { rects: merged }
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn bounding_rect(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::empty(), |acc, r| acc.united(r))
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains(x, y))
    }

    pub fn area(&self) -> i64 {
        self.rects.iter().map(Rect::area).sum()
    }

    /// Clip every rectangle to `clip`
    pub fn intersected(&self, clip: &Rect) -> Region {
        Region::from_rects(self.rects.iter().map(|r| r.intersected(clip)).collect())
    }
}
