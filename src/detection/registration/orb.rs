//! Oriented FAST / rotated BRIEF features and brute-force Hamming matching.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::cmp::Ordering;

use super::RegistrationConfig;

/// Radius of the circular patch used for the intensity-centroid orientation.
const ORIENTATION_RADIUS: i32 = 15;
/// Test points are drawn from `[-PATTERN_EXTENT, PATTERN_EXTENT]²`.
const PATTERN_EXTENT: i32 = 13;
/// Keypoints closer than this to a level's border are discarded, so rotated
/// test points (at most 13·√2 away) and the orientation patch stay inside.
const BORDER: u32 = 20;
const DESCRIPTOR_BITS: usize = 256;
const DESCRIPTOR_SIGMA: f32 = 2.0;
const PATTERN_SEED: u64 = 0x0b5e_55ed_f1a5_0001;

/// Keypoint in level-0 (full resolution) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub octave: u8,
    /// Orientation in radians.
    pub angle: f32,
    pub response: f32,
}

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor([u64; 4]);

impl Descriptor {
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct Feature {
    pub keypoint: Keypoint,
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    /// Index into the base features.
    pub query: usize,
    /// Index into the target features.
    pub train: usize,
    pub distance: u32,
}

struct PyramidLevel {
    image: GrayImage,
    scale: f32,
}

pub struct OrbExtractor {
    max_features: usize,
    fast_threshold: u8,
    levels: usize,
    scale_factor: f32,
    pattern: Vec<[i8; 4]>,
}

impl OrbExtractor {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            max_features: config.max_features,
            fast_threshold: config.fast_threshold,
            levels: config.pyramid_levels.max(1),
            scale_factor: config.scale_factor.max(1.0),
            pattern: sampling_pattern(PATTERN_SEED),
        }
    }

    /// Detect and describe up to `max_features` keypoints across the pyramid.
    pub fn extract(&self, image: &GrayImage) -> Vec<Feature> {
        let pyramid = self.build_pyramid(image);
        let budgets = level_budgets(self.max_features, pyramid.len(), self.scale_factor);

        let per_level: Vec<Vec<Feature>> = pyramid
            .par_iter()
            .zip(budgets.par_iter())
            .enumerate()
            .map(|(octave, (level, &budget))| self.extract_level(level, octave as u8, budget))
            .collect();

        per_level.into_iter().flatten().collect()
    }

    fn build_pyramid(&self, image: &GrayImage) -> Vec<PyramidLevel> {
        let mut pyramid = vec![PyramidLevel {
            image: image.clone(),
            scale: 1.0,
        }];

        for octave in 1..self.levels {
            let scale = self.scale_factor.powi(octave as i32);
            let width = (image.width() as f32 / scale).round() as u32;
            let height = (image.height() as f32 / scale).round() as u32;
            if width <= 2 * BORDER || height <= 2 * BORDER {
                break;
            }
            pyramid.push(PyramidLevel {
                image: imageops::resize(image, width, height, FilterType::Triangle),
                scale,
            });
        }

        pyramid
    }

    fn extract_level(&self, level: &PyramidLevel, octave: u8, budget: usize) -> Vec<Feature> {
        let image = &level.image;
        let (width, height) = image.dimensions();
        if budget == 0 || width <= 2 * BORDER || height <= 2 * BORDER {
            return Vec::new();
        }

        let corners: Vec<Corner> = corners_fast9(image, self.fast_threshold)
            .into_iter()
            .filter(|c| {
                c.x >= BORDER && c.y >= BORDER && c.x < width - BORDER && c.y < height - BORDER
            })
            .collect();

        let mut corners = suppress_non_maxima(corners, width, height);
        corners.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        corners.truncate(budget);

        let smoothed = gaussian_blur_f32(image, DESCRIPTOR_SIGMA);

        corners
            .par_iter()
            .map(|corner| {
                let angle = intensity_centroid_angle(image, corner.x, corner.y);
                Feature {
                    keypoint: Keypoint {
                        x: corner.x as f32 * level.scale,
                        y: corner.y as f32 * level.scale,
                        octave,
                        angle,
                        response: corner.score,
                    },
                    descriptor: self.describe(&smoothed, corner.x, corner.y, angle),
                }
            })
            .collect()
    }

    /// Rotated BRIEF: bit i is set when the first test point is darker than the second.
    fn describe(&self, smoothed: &GrayImage, x: u32, y: u32, angle: f32) -> Descriptor {
        let (sin, cos) = angle.sin_cos();
        let sample = |dx: i8, dy: i8| {
            let rx = (dx as f32 * cos - dy as f32 * sin).round() as i32;
            let ry = (dx as f32 * sin + dy as f32 * cos).round() as i32;
            smoothed.get_pixel((x as i32 + rx) as u32, (y as i32 + ry) as u32)[0]
        };

        let mut bits = [0u64; 4];
        for (i, &[ax, ay, bx, by]) in self.pattern.iter().enumerate() {
            if sample(ax, ay) < sample(bx, by) {
                bits[i / 64] |= 1 << (i % 64);
            }
        }
        Descriptor(bits)
    }
}

/// Split `total` across levels geometrically, finer levels getting more.
fn level_budgets(total: usize, levels: usize, scale_factor: f32) -> Vec<usize> {
    if levels == 0 {
        return Vec::new();
    }
    let factor = 1.0 / scale_factor as f64;
    let denominator = 1.0 - factor.powi(levels as i32);
    let mut per_level = if denominator.abs() < 1e-9 {
        total as f64 / levels as f64
    } else {
        total as f64 * (1.0 - factor) / denominator
    };

    let mut budgets = Vec::with_capacity(levels);
    let mut assigned = 0;
    for _ in 0..levels - 1 {
        let n = (per_level.round() as usize).min(total - assigned);
        budgets.push(n);
        assigned += n;
        per_level *= factor;
    }
    budgets.push(total - assigned);
    budgets
}

/// Keep corners whose score is not beaten by any 8-neighbour. Equal scores
/// resolve to the neighbour earliest in raster order.
fn suppress_non_maxima(corners: Vec<Corner>, width: u32, height: u32) -> Vec<Corner> {
    let mut scores = vec![f32::NEG_INFINITY; (width * height) as usize];
    for c in &corners {
        scores[(c.y * width + c.x) as usize] = c.score;
    }

    corners
        .into_iter()
        .filter(|c| {
            let own = c.y * width + c.x;
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = c.x as i32 + dx;
                    let ny = c.y as i32 + dy;
                    if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
                        continue;
                    }
                    let idx = ny as u32 * width + nx as u32;
                    let other = scores[idx as usize];
                    if other > c.score || (other == c.score && idx < own) {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

fn intensity_centroid_angle(image: &GrayImage, x: u32, y: u32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > ORIENTATION_RADIUS * ORIENTATION_RADIUS {
                continue;
            }
            let px = x as i32 + dx;
            let py = y as i32 + dy;
            if px < 0 || py < 0 || px >= image.width() as i32 || py >= image.height() as i32 {
                continue;
            }
            let intensity = image.get_pixel(px as u32, py as u32)[0] as f32;
            m10 += intensity * dx as f32;
            m01 += intensity * dy as f32;
        }
    }
    m01.atan2(m10)
}

/// Fixed pseudo-random test pattern; the seed keeps descriptors comparable
/// across processes.
fn sampling_pattern(seed: u64) -> Vec<[i8; 4]> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pattern = Vec::with_capacity(DESCRIPTOR_BITS);
    while pattern.len() < DESCRIPTOR_BITS {
        let mut coord = || rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT) as i8;
        let pair = [coord(), coord(), coord(), coord()];
        if pair[0] != pair[2] || pair[1] != pair[3] {
            pattern.push(pair);
        }
    }
    pattern
}

/// Nearest target descriptor for every base descriptor. No ratio test and no
/// cross-check: bad matches are left for RANSAC to reject.
pub fn match_features(base: &[Feature], target: &[Feature]) -> Vec<FeatureMatch> {
    base.par_iter()
        .enumerate()
        .filter_map(|(query, feature)| {
            target
                .iter()
                .enumerate()
                .map(|(train, candidate)| (train, feature.descriptor.distance(&candidate.descriptor)))
                .min_by_key(|&(_, distance)| distance)
                .map(|(train, distance)| FeatureMatch {
                    query,
                    train,
                    distance,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::test_utils::blocky_texture;
    use image::Luma;

    #[test]
    fn budgets_sum_to_total_and_decrease() {
        let budgets = level_budgets(5000, 8, 1.2);
        assert_eq!(budgets.len(), 8);
        assert_eq!(budgets.iter().sum::<usize>(), 5000);
        assert!(budgets[0] > budgets[1]);
        assert!(budgets[1] > budgets[6]);
    }

    #[test]
    fn single_level_gets_whole_budget() {
        assert_eq!(level_budgets(300, 1, 1.2), vec![300]);
    }

    #[test]
    fn uniform_image_has_no_features() {
        let extractor = OrbExtractor::new(&RegistrationConfig::default());
        let flat = GrayImage::from_pixel(320, 240, Luma([90]));
        assert!(extractor.extract(&flat).is_empty());
    }

    #[test]
    fn textured_image_respects_budget() {
        let config = RegistrationConfig {
            max_features: 300,
            ..RegistrationConfig::default()
        };
        let extractor = OrbExtractor::new(&config);
        let features = extractor.extract(&blocky_texture(320, 240, 3));
        assert!(!features.is_empty());
        assert!(features.len() <= 300);
        for f in &features {
            assert!(f.keypoint.x >= 0.0 && f.keypoint.x < 320.0);
            assert!(f.keypoint.y >= 0.0 && f.keypoint.y < 240.0);
        }
    }

    #[test]
    fn identical_images_match_at_zero_distance() {
        let extractor = OrbExtractor::new(&RegistrationConfig::default());
        let image = blocky_texture(256, 192, 11);
        let a = extractor.extract(&image);
        let b = extractor.extract(&image);
        assert_eq!(a.len(), b.len());

        let matches = match_features(&a, &b);
        assert_eq!(matches.len(), a.len());
        assert!(matches.iter().all(|m| m.distance == 0));
    }

    #[test]
    fn matching_against_nothing_yields_nothing() {
        let extractor = OrbExtractor::new(&RegistrationConfig::default());
        let a = extractor.extract(&blocky_texture(128, 128, 5));
        assert!(match_features(&a, &[]).is_empty());
    }

    #[test]
    fn hamming_distance_counts_differing_bits() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, u64::MAX, 0]);
        assert_eq!(a.distance(&b), 3 + 64);
        assert_eq!(b.distance(&b), 0);
    }
}
