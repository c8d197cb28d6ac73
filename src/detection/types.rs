use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

/// Axis-aligned flaw region, top-left origin, integer pixels.
///
/// The rectangle is half-open: `[x, x + w) × [y, y + h)`. Boxes built from
/// connected components always carry `area == w * h`; boxes built from an
/// external 5-tuple keep whatever area was supplied.
///
/// Serializes as the ordered tuple `(x, y, w, h, area)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 5]", into = "[u32; 5]")]
pub struct FlawBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub area: u32,
}

impl FlawBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            area: w.saturating_mul(h),
        }
    }

    /// Exclusive right edge, clamped to `u32::MAX`.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.w)
    }

    /// Exclusive bottom edge, clamped to `u32::MAX`.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.h)
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// True when the two rectangles share a region of positive area.
    /// Touching edges do not count.
    pub fn intersects(&self, other: &FlawBox) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Overlap rectangle, or `None` when the boxes do not intersect.
    pub fn intersection(&self, other: &FlawBox) -> Option<FlawBox> {
        if !self.intersects(other) {
            return None;
        }
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Some(FlawBox::new(x, y, right - x, bottom - y))
    }

    /// Smallest rectangle enclosing both boxes.
    pub fn union(&self, other: &FlawBox) -> FlawBox {
        if other.is_empty() {
            return FlawBox::new(self.x, self.y, self.w, self.h);
        }
        if self.is_empty() {
            return FlawBox::new(other.x, other.y, other.w, other.h);
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        FlawBox::new(x, y, right - x, bottom - y)
    }

    /// True when `other` lies entirely inside this box.
    pub fn contains(&self, other: &FlawBox) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Rescale into another coordinate frame. Edges are rounded outward so
    /// the scaled box never shrinks below the region it covers.
    pub fn scaled(&self, sx: f64, sy: f64) -> FlawBox {
        let x = (self.x as f64 * sx).floor().max(0.0) as u32;
        let y = (self.y as f64 * sy).floor().max(0.0) as u32;
        let right = (self.right() as f64 * sx).ceil().max(0.0) as u32;
        let bottom = (self.bottom() as f64 * sy).ceil().max(0.0) as u32;
        FlawBox::new(x, y, right.saturating_sub(x), bottom.saturating_sub(y))
    }
}

impl From<[u32; 5]> for FlawBox {
    fn from([x, y, w, h, area]: [u32; 5]) -> Self {
        Self { x, y, w, h, area }
    }
}

impl From<FlawBox> for [u32; 5] {
    fn from(b: FlawBox) -> Self {
        [b.x, b.y, b.w, b.h, b.area]
    }
}

/// Binary map of changed pixels: 255 where base and target differ, 0 elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMap(GrayImage);

impl ChangeMap {
    pub const FOREGROUND: u8 = 255;

    pub fn new(image: GrayImage) -> Self {
        Self(image)
    }

    pub fn empty(width: u32, height: u32) -> Self {
        Self(GrayImage::new(width, height))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    pub fn is_changed(&self, x: u32, y: u32) -> bool {
        self.0.get_pixel(x, y)[0] == Self::FOREGROUND
    }

    pub fn changed_pixels(&self) -> u64 {
        self.0
            .pixels()
            .filter(|p| p[0] == Self::FOREGROUND)
            .count() as u64
    }

    /// True when no pixel is flagged.
    pub fn is_clear(&self) -> bool {
        self.0.pixels().all(|p| p[0] != Self::FOREGROUND)
    }

    pub fn as_image(&self) -> &GrayImage {
        &self.0
    }
}

/// Target-frame pixels that received data from the warped base: 1 valid, 0 not.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidityMask(GrayImage);

impl ValidityMask {
    pub fn new(mask: GrayImage) -> Self {
        Self(mask)
    }

    /// Every pixel valid, as for the identity alignment.
    pub fn full(width: u32, height: u32) -> Self {
        Self(GrayImage::from_pixel(width, height, Luma([1])))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        self.0.get_pixel(x, y)[0] != 0
    }

    pub fn valid_pixels(&self) -> u64 {
        self.0.pixels().filter(|p| p[0] != 0).count() as u64
    }

    pub fn is_all_valid(&self) -> bool {
        self.0.pixels().all(|p| p[0] != 0)
    }

    /// Elementwise product with `image`: pixels outside the mask become black.
    ///
    /// # Panics
    /// If `image` does not have the mask's dimensions.
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        assert_eq!(
            image.dimensions(),
            self.dimensions(),
            "validity mask and image must have the same dimensions"
        );
        let mut masked = image.clone();
        for (pixel, m) in masked.pixels_mut().zip(self.0.pixels()) {
            if m[0] == 0 {
                pixel.0 = [0, 0, 0];
            }
        }
        masked
    }
}
