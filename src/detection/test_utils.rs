//! Synthetic scenes shared by the detection tests.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random 8×8 blocks: plenty of FAST corners with distinctive patches.
pub(crate) fn blocky_texture(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let cols = width.div_ceil(8);
    let rows = height.div_ceil(8);
    let blocks: Vec<u8> = (0..cols * rows).map(|_| rng.gen_range(0..=255)).collect();
    GrayImage::from_fn(width, height, |x, y| {
        Luma([blocks[((y / 8) * cols + x / 8) as usize]])
    })
}

pub(crate) fn blocky_rgb(width: u32, height: u32, seed: u64) -> RgbImage {
    let gray = blocky_texture(width, height, seed);
    RgbImage::from_fn(width, height, |x, y| {
        let v = gray.get_pixel(x, y)[0];
        Rgb([v, v.wrapping_mul(3), 255 - v])
    })
}

pub(crate) fn uniform(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(color))
}

/// Copy of `image` with a filled `size`×`size` square at (`x`, `y`).
pub(crate) fn with_square(image: &RgbImage, x: i32, y: i32, size: u32, color: [u8; 3]) -> RgbImage {
    let mut out = image.clone();
    draw_filled_rect_mut(&mut out, Rect::at(x, y).of_size(size, size), Rgb(color));
    out
}

/// `image` shifted by (`dx`, `dy`) pixels, uncovered area filled black.
pub(crate) fn translated(image: &RgbImage, dx: i32, dy: i32) -> RgbImage {
    let (w, h) = image.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let sx = x as i32 - dx;
        let sy = y as i32 - dy;
        if sx >= 0 && sy >= 0 && (sx as u32) < w && (sy as u32) < h {
            *image.get_pixel(sx as u32, sy as u32)
        } else {
            Rgb([0, 0, 0])
        }
    })
}
