use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle of a detected face, in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clip the region to a `width` × `height` frame.
    ///
    /// Returns `None` when nothing of the region lies inside the frame.
    pub fn clip(&self, width: u32, height: u32) -> Option<FaceRegion> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let clipped = FaceRegion {
            x: self.x,
            y: self.y,
            width: self.right().min(width) - self.x,
            height: self.bottom().min(height) - self.y,
        };
        (!clipped.is_empty()).then_some(clipped)
    }

    /// Whether the pixel `(px, py)` lies inside the region.
    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }
}

/// Width × height pair used for detector size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Square size, as used for `min_size = 30` → 30×30.
    pub fn square(side: u32) -> Self {
        Self::new(side, side)
    }

    /// True when `self` is at least `other` in both dimensions.
    pub fn covers(&self, other: Size) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}
