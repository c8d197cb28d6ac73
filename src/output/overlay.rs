use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detection::FlawBox;

/// Stroke width of drawn flaw boxes, in output pixels.
pub const BOX_STROKE_WIDTH: u32 = 5;
const BOX_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Flaw boxes plus the frame size they were computed against.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub boxes: Vec<FlawBox>,
    pub width: u32,
    pub height: u32,
}

impl Overlay {
    pub fn new(boxes: Vec<FlawBox>, width: u32, height: u32) -> Self {
        Self {
            boxes,
            width,
            height,
        }
    }

    /// Nothing to draw, e.g. while no reference is set.
    pub fn empty(width: u32, height: u32) -> Self {
        Self::new(Vec::new(), width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Rescale the boxes into a `width`×`height` display frame.
    pub fn scaled_to(&self, width: u32, height: u32) -> Overlay {
        if (width, height) == (self.width, self.height) || self.width == 0 || self.height == 0 {
            return Overlay::new(self.boxes.clone(), width, height);
        }
        let sx = width as f64 / self.width as f64;
        let sy = height as f64 / self.height as f64;
        let boxes = self.boxes.iter().map(|b| b.scaled(sx, sy)).collect();
        Overlay::new(boxes, width, height)
    }
}

/// Draw the overlay's boxes onto `frame` as white hollow rectangles, growing
/// inward from each box edge.
pub fn draw_overlay(frame: &mut RgbImage, overlay: &Overlay) {
    let (width, height) = frame.dimensions();
    let overlay = overlay.scaled_to(width, height);

    for b in overlay.boxes.iter().filter(|b| !b.is_empty()) {
        for inset in 0..BOX_STROKE_WIDTH {
            let w = b.w.saturating_sub(2 * inset);
            let h = b.h.saturating_sub(2 * inset);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((b.x + inset) as i32, (b.y + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(frame, rect, BOX_COLOR);
        }
    }
}
