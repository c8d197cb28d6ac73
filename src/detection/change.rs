//! Per-pixel change map between the aligned base and the masked target.

use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::median_filter;
use imageproc::morphology::{dilate, erode};

use super::types::ChangeMap;

#[derive(Debug, Clone)]
pub struct ChangeConfig {
    /// Radius of the first median blur, applied in colour (7×7 window).
    pub coarse_median_radius: u32,
    /// Radius of the second median blur, applied in grayscale (5×5 window).
    pub fine_median_radius: u32,
    /// Intensities are stretched onto `[0, intensity_ceiling]`.
    pub intensity_ceiling: u8,
    /// A pixel changed when its smoothed difference is strictly above this.
    pub diff_threshold: u8,
    /// Open (erode then dilate, 3×3) the thresholded map before extraction.
    pub morphological_cleanup: bool,
}

impl Default for ChangeConfig {
    fn default() -> Self {
        Self {
            coarse_median_radius: 3,
            fine_median_radius: 2,
            intensity_ceiling: 128,
            diff_threshold: 5,
            morphological_cleanup: true,
        }
    }
}

/// Binary change map between `aligned_base` and `masked_target`.
///
/// Empty images give an empty map.
///
/// # Panics
/// If the two images differ in size.
pub fn detect_changes(
    aligned_base: &RgbImage,
    masked_target: &RgbImage,
    config: &ChangeConfig,
) -> ChangeMap {
    assert_eq!(
        aligned_base.dimensions(),
        masked_target.dimensions(),
        "change detection needs equally sized images"
    );
    let (width, height) = masked_target.dimensions();
    if width == 0 || height == 0 {
        return ChangeMap::empty(width, height);
    }

    let _span = tracing::debug_span!("detect_changes").entered();

    let (base, target) = rayon::join(
        || smooth(aligned_base, config),
        || smooth(masked_target, config),
    );

    let threshold = config.diff_threshold;
    let mut map = GrayImage::from_fn(width, height, |x, y| {
        let d = base.get_pixel(x, y)[0].abs_diff(target.get_pixel(x, y)[0]);
        Luma([if d > threshold { ChangeMap::FOREGROUND } else { 0 }])
    });

    if config.morphological_cleanup {
        map = dilate(&erode(&map, Norm::LInf, 1), Norm::LInf, 1);
    }

    let map = ChangeMap::new(map);
    tracing::debug!("{} changed pixels", map.changed_pixels());
    map
}

/// Denoise and flatten one input: colour median, contrast stretch, grayscale,
/// then a smaller median.
pub fn smooth(image: &RgbImage, config: &ChangeConfig) -> GrayImage {
    let blurred = median_filter(
        image,
        config.coarse_median_radius,
        config.coarse_median_radius,
    );
    let stretched = stretch_contrast(&blurred, config.intensity_ceiling);
    let gray = imageops::grayscale(&stretched);
    median_filter(&gray, config.fine_median_radius, config.fine_median_radius)
}

/// Min-max normalize all channels jointly onto `[0, ceiling]`.
/// A constant image maps to all zeros.
pub fn stretch_contrast(image: &RgbImage, ceiling: u8) -> RgbImage {
    let (lo, hi) = image
        .as_raw()
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let mut out = image.clone();
    if hi <= lo {
        out.as_mut().fill(0);
        return out;
    }

    let scale = ceiling as f32 / (hi - lo) as f32;
    for v in out.as_mut().iter_mut() {
        *v = ((*v - lo) as f32 * scale).round() as u8;
    }
    out
}
