pub mod change;
pub mod components;
pub mod merge;
pub mod registration;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use change::{detect_changes, ChangeConfig};
pub use components::{area_thresholds, extract_boxes, ExtractionConfig};
pub use merge::merge;
pub use registration::{register, Homography, Registration, RegistrationConfig, RegistrationError};
pub use types::{ChangeMap, FlawBox, ValidityMask};

use image::RgbImage;
use thiserror::Error;

/// Tunables for every stage of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub registration: RegistrationConfig,
    pub change: ChangeConfig,
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Error)]
pub enum DetectError {
    /// No registration possible for this frame.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("empty {role} image ({width}x{height})")]
    EmptyImage {
        role: &'static str,
        width: u32,
        height: u32,
    },
    #[error("{role} is {found:?}, expected {expected:?}")]
    DimensionMismatch {
        role: &'static str,
        expected: (u32, u32),
        found: (u32, u32),
    },
}

impl DetectError {
    /// Registration failures skip the frame; the rest are caller bugs.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DetectError::Registration(_))
    }
}

/// How the base was brought into the target frame.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentSummary {
    pub homography: Homography,
    pub matches: usize,
    pub inliers: usize,
}

/// Result of one pipeline run.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Merged flaw boxes in target-frame coordinates.
    pub boxes: Vec<FlawBox>,
    /// Size of the frame the boxes were computed against.
    pub frame_size: (u32, u32),
    pub changed_pixels: u64,
    /// `None` when the caller supplied an already aligned base.
    pub alignment: Option<AlignmentSummary>,
}

/// Base-vs-target flaw detection: registration, change map, component
/// extraction and box merging.
#[derive(Debug, Clone, Default)]
pub struct FlawDetector {
    config: PipelineConfig,
}

impl FlawDetector {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the full pipeline on a reference and a live frame.
    pub fn detect(&self, base: &RgbImage, target: &RgbImage) -> Result<Detection, DetectError> {
        ensure_non_empty("base", base)?;
        ensure_non_empty("target", target)?;

        let registration = register(base, target, &self.config.registration)?;
        let summary = AlignmentSummary {
            homography: registration.homography,
            matches: registration.matches,
            inliers: registration.inliers,
        };

        let mut detection =
            self.detect_registered(&registration.aligned, &registration.mask, target)?;
        detection.alignment = Some(summary);
        Ok(detection)
    }

    /// Run the pipeline from an already aligned base and its validity mask.
    pub fn detect_registered(
        &self,
        aligned_base: &RgbImage,
        mask: &ValidityMask,
        target: &RgbImage,
    ) -> Result<Detection, DetectError> {
        ensure_non_empty("target", target)?;
        let frame_size = target.dimensions();
        for (role, found) in [
            ("aligned base", aligned_base.dimensions()),
            ("validity mask", mask.dimensions()),
        ] {
            if found != frame_size {
                return Err(DetectError::DimensionMismatch {
                    role,
                    expected: frame_size,
                    found,
                });
            }
        }

        let masked_target = mask.apply(target);
        let map = detect_changes(aligned_base, &masked_target, &self.config.change);
        let candidates = extract_boxes(&map, &self.config.extraction);
        let boxes = merge(candidates);

        tracing::debug!("{} flaw boxes", boxes.len());

        Ok(Detection {
            boxes,
            frame_size,
            changed_pixels: map.changed_pixels(),
            alignment: None,
        })
    }
}

fn ensure_non_empty(role: &'static str, image: &RgbImage) -> Result<(), DetectError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(DetectError::EmptyImage {
            role,
            width,
            height,
        });
    }
    Ok(())
}
