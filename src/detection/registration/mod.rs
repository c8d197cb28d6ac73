//! Feature-based registration of the reference ("base") image onto the live
//! ("target") frame.

mod homography;
mod orb;

pub use homography::Homography;
pub use orb::{Descriptor, Feature, FeatureMatch, Keypoint, OrbExtractor};

use image::imageops;
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation};
use thiserror::Error;

use super::types::ValidityMask;
use homography::{fit_homography_ransac, RansacParams, MIN_CORRESPONDENCES};
use orb::match_features;

/// Tunables for feature extraction and the robust fit.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Feature budget per image, spread across the pyramid.
    pub max_features: usize,
    /// FAST-9 intensity threshold.
    pub fast_threshold: u8,
    pub pyramid_levels: usize,
    pub scale_factor: f32,
    /// Maximum reprojection error (px) for a correspondence to count as an inlier.
    pub ransac_threshold: f64,
    pub ransac_confidence: f64,
    pub ransac_max_iters: usize,
    pub seed: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_features: 5000,
            fast_threshold: 20,
            pyramid_levels: 8,
            scale_factor: 1.2,
            ransac_threshold: 0.5,
            ransac_confidence: 0.995,
            ransac_max_iters: 2000,
            seed: 0,
        }
    }
}

/// Why a frame could not be aligned. Both kinds are recoverable: the frame is
/// skipped and the next one is tried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("insufficient matches: a homography needs 4 consistent correspondences, found {found}")]
    InsufficientMatches { found: usize },
    #[error("degenerate input: base yielded {base_features} features, target {target_features}")]
    DegenerateInput {
        base_features: usize,
        target_features: usize,
    },
}

/// Base image resampled into the target frame.
#[derive(Debug, Clone)]
pub struct Registration {
    pub aligned: RgbImage,
    pub mask: ValidityMask,
    pub homography: Homography,
    /// Correspondences handed to RANSAC.
    pub matches: usize,
    pub inliers: usize,
}

/// Homography estimate plus the bookkeeping behind it.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub homography: Homography,
    pub base_features: usize,
    pub target_features: usize,
    pub matches: usize,
    pub inliers: usize,
}

/// Align `base` onto `target`'s coordinate frame.
///
/// Pixel-identical inputs align under the identity without feature
/// extraction. Otherwise ORB features are matched, a RANSAC homography is fit
/// and the base is warped into a buffer the size of the target. The validity
/// mask is the same bilinear warp of a fully-lit image, binarized at half
/// intensity.
pub fn register(
    base: &RgbImage,
    target: &RgbImage,
    config: &RegistrationConfig,
) -> Result<Registration, RegistrationError> {
    let _span = tracing::debug_span!("register").entered();
    let (width, height) = target.dimensions();

    if base.dimensions() == target.dimensions() && base.as_raw() == target.as_raw() {
        tracing::debug!("Base and target are pixel-identical, aligning with identity");
        return Ok(Registration {
            aligned: base.clone(),
            mask: ValidityMask::full(width, height),
            homography: Homography::identity(),
            matches: 0,
            inliers: 0,
        });
    }

    let base_gray = imageops::grayscale(base);
    let target_gray = imageops::grayscale(target);
    let alignment = estimate_alignment(&base_gray, &target_gray, config)?;

    let projection =
        alignment
            .homography
            .to_projection()
            .ok_or(RegistrationError::InsufficientMatches {
                found: alignment.inliers,
            })?;

    let mut aligned = RgbImage::new(width, height);
    warp_into(
        base,
        &projection,
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut aligned,
    );

    // Same bilinear footprint as the base warp: a pixel is valid only where
    // every sample it blends came from the base.
    let lit = GrayImage::from_pixel(base.width(), base.height(), Luma([u8::MAX]));
    let mut support = GrayImage::new(width, height);
    warp_into(
        &lit,
        &projection,
        Interpolation::Bilinear,
        Luma([0]),
        &mut support,
    );
    for p in support.pixels_mut() {
        p.0[0] = u8::from(p.0[0] >= 128);
    }

    Ok(Registration {
        aligned,
        mask: ValidityMask::new(support),
        homography: alignment.homography,
        matches: alignment.matches,
        inliers: alignment.inliers,
    })
}

/// Estimate the base→target homography from intensity images.
pub fn estimate_alignment(
    base: &GrayImage,
    target: &GrayImage,
    config: &RegistrationConfig,
) -> Result<Alignment, RegistrationError> {
    let extractor = OrbExtractor::new(config);
    let (base_features, target_features) =
        rayon::join(|| extractor.extract(base), || extractor.extract(target));

    tracing::debug!(
        "Extracted {} base / {} target features",
        base_features.len(),
        target_features.len()
    );

    if base_features.is_empty() || target_features.is_empty() {
        return Err(RegistrationError::DegenerateInput {
            base_features: base_features.len(),
            target_features: target_features.len(),
        });
    }

    let matches = match_features(&base_features, &target_features);
    if matches.len() < MIN_CORRESPONDENCES {
        return Err(RegistrationError::InsufficientMatches {
            found: matches.len(),
        });
    }

    let (src, dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) = matches
        .iter()
        .map(|m| {
            let s = &base_features[m.query].keypoint;
            let d = &target_features[m.train].keypoint;
            ([s.x as f64, s.y as f64], [d.x as f64, d.y as f64])
        })
        .unzip();

    let fit = fit_homography_ransac(&src, &dst, &RansacParams::from(config)).ok_or(
        RegistrationError::InsufficientMatches {
            found: matches.len(),
        },
    )?;

    tracing::debug!(
        "RANSAC kept {}/{} matches after {} iterations",
        fit.inliers.len(),
        matches.len(),
        fit.iterations
    );

    Ok(Alignment {
        homography: fit.homography,
        base_features: base_features.len(),
        target_features: target_features.len(),
        matches: matches.len(),
        inliers: fit.inliers.len(),
    })
}
