//! Base-to-target homography: 4-point DLT with Hartley normalization inside
//! an adaptive RANSAC loop, refit on the final inlier set.

use imageproc::geometric_transformations::Projection;
use nalgebra::{Matrix3, SMatrix, SVector, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::RegistrationConfig;

/// Minimal sample size for a projective fit.
pub const MIN_CORRESPONDENCES: usize = 4;

/// Twice the triangle area (px²) below which three sample points count as collinear.
const COLLINEAR_EPS: f64 = 1e-3;

/// 3×3 projective transform mapping base coordinates to target coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
}

impl Homography {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    /// Wrap a matrix, scaling it so `h[2][2] == 1` when that entry is non-zero.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        let scale = matrix[(2, 2)];
        if scale.abs() > 1e-15 {
            Self {
                matrix: matrix / scale,
            }
        } else {
            Self { matrix }
        }
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Map a base point into the target frame. `None` for points sent to infinity.
    pub fn project(&self, x: f64, y: f64) -> Option<[f64; 2]> {
        let p = self.matrix * Vector3::new(x, y, 1.0);
        if p[2].abs() < 1e-15 {
            return None;
        }
        Some([p[0] / p[2], p[1] / p[2]])
    }

    /// Farthest any corner of a `width`×`height` frame moves under this
    /// transform, in pixels. Infinite when a corner is sent to infinity.
    pub fn corner_drift(&self, width: u32, height: u32) -> f64 {
        let (w, h) = (width as f64, height as f64);
        [[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]]
            .iter()
            .map(|corner| reprojection_error(self, corner, corner))
            .fold(0.0, f64::max)
    }

    pub fn is_invertible(&self) -> bool {
        self.matrix.determinant().abs() > 1e-12 && self.matrix.iter().all(|v| v.is_finite())
    }

    pub(crate) fn to_projection(&self) -> Option<Projection> {
        if !self.is_invertible() {
            return None;
        }
        let m = &self.matrix;
        Projection::from_matrix([
            m[(0, 0)] as f32,
            m[(0, 1)] as f32,
            m[(0, 2)] as f32,
            m[(1, 0)] as f32,
            m[(1, 1)] as f32,
            m[(1, 2)] as f32,
            m[(2, 0)] as f32,
            m[(2, 1)] as f32,
            m[(2, 2)] as f32,
        ])
    }
}

pub(crate) fn reprojection_error(h: &Homography, src: &[f64; 2], dst: &[f64; 2]) -> f64 {
    match h.project(src[0], src[1]) {
        Some(p) => ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// RANSAC knobs, lifted out of [`RegistrationConfig`].
#[derive(Debug, Clone)]
pub(crate) struct RansacParams {
    pub threshold: f64,
    pub confidence: f64,
    pub max_iters: usize,
    pub seed: u64,
}

impl From<&RegistrationConfig> for RansacParams {
    fn from(config: &RegistrationConfig) -> Self {
        Self {
            threshold: config.ransac_threshold,
            confidence: config.ransac_confidence,
            max_iters: config.ransac_max_iters,
            seed: config.seed,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RansacFit {
    pub homography: Homography,
    pub inliers: Vec<usize>,
    pub iterations: usize,
}

/// Translate the centroid to the origin and scale so the mean distance from
/// it is sqrt(2).
fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;

    let mean_dist = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();

    (t, normalized)
}

/// Least-squares DLT over `src.len() >= 4` correspondences.
pub(crate) fn estimate_homography_dlt(src: &[[f64; 2]], dst: &[[f64; 2]]) -> Option<Homography> {
    if src.len() < MIN_CORRESPONDENCES || src.len() != dst.len() {
        return None;
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    // Accumulate AᵀA directly; each correspondence contributes two rows of A.
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (s, d) in src_n.iter().zip(&dst_n) {
        let (sx, sy) = (s[0], s[1]);
        let (dx, dy) = (d[0], d[1]);
        let r1 = SVector::<f64, 9>::from_column_slice(&[
            0.0, 0.0, 0.0, -sx, -sy, -1.0, dy * sx, dy * sy, dy,
        ]);
        let r2 = SVector::<f64, 9>::from_column_slice(&[
            sx, sy, 1.0, 0.0, 0.0, 0.0, -dx * sx, -dx * sy, -dx,
        ]);
        ata += r1 * r1.transpose();
        ata += r2 * r2.transpose();
    }

    // h is the eigenvector of the smallest eigenvalue of AᵀA.
    let eig = SymmetricEigen::new(ata);
    let min_idx = eig.eigenvalues.iamin();
    let h = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst.try_inverse()?;
    let homography = Homography::from_matrix(t_dst_inv * h_norm * t_src);
    homography.is_invertible().then_some(homography)
}

fn is_degenerate_sample(pts: &[[f64; 2]]) -> bool {
    for i in 0..pts.len() {
        for j in (i + 1)..pts.len() {
            for k in (j + 1)..pts.len() {
                let (a, b, c) = (pts[i], pts[j], pts[k]);
                let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
                if cross.abs() < COLLINEAR_EPS {
                    return true;
                }
            }
        }
    }
    false
}

/// Floyd's algorithm: `k` distinct indices from `0..n`.
fn sample_indices<R: Rng>(rng: &mut R, n: usize, k: usize, buffer: &mut Vec<usize>) {
    buffer.clear();
    for j in (n - k)..n {
        let t = rng.gen_range(0..=j);
        if buffer.contains(&t) {
            buffer.push(j);
        } else {
            buffer.push(t);
        }
    }
}

fn collect_inliers(h: &Homography, src: &[[f64; 2]], dst: &[[f64; 2]], threshold: f64) -> Vec<usize> {
    src.iter()
        .zip(dst)
        .enumerate()
        .filter(|(_, (s, d))| reprojection_error(h, s, d) <= threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Iterations needed to draw one all-inlier sample with the given confidence.
pub(crate) fn adaptive_iterations(inlier_ratio: f64, sample_size: usize, confidence: f64) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_outlier = (1.0 - w_n).ln();
    if log_outlier >= 0.0 {
        return usize::MAX;
    }
    ((1.0 - confidence).ln() / log_outlier).ceil().max(1.0) as usize
}

/// Robustly fit `dst ≈ H · src`. Returns `None` when fewer than four
/// correspondences are given or no sample reaches four inliers.
pub(crate) fn fit_homography_ransac(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    params: &RansacParams,
) -> Option<RansacFit> {
    let n = src.len().min(dst.len());
    if n < MIN_CORRESPONDENCES {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut sample = Vec::with_capacity(MIN_CORRESPONDENCES);
    let mut sample_src = Vec::with_capacity(MIN_CORRESPONDENCES);
    let mut sample_dst = Vec::with_capacity(MIN_CORRESPONDENCES);

    let mut best: Option<(Homography, Vec<usize>)> = None;
    let mut required = params.max_iters;
    let mut iterations = 0;

    while iterations < required.min(params.max_iters) {
        iterations += 1;

        sample_indices(&mut rng, n, MIN_CORRESPONDENCES, &mut sample);
        sample_src.clear();
        sample_dst.clear();
        for &i in &sample {
            sample_src.push(src[i]);
            sample_dst.push(dst[i]);
        }
        if is_degenerate_sample(&sample_src) || is_degenerate_sample(&sample_dst) {
            continue;
        }

        let Some(h) = estimate_homography_dlt(&sample_src, &sample_dst) else {
            continue;
        };

        let inliers = collect_inliers(&h, src, dst, params.threshold);
        let best_count = best.as_ref().map_or(0, |(_, b)| b.len());
        if inliers.len() > best_count {
            let ratio = inliers.len() as f64 / n as f64;
            required = adaptive_iterations(ratio, MIN_CORRESPONDENCES, params.confidence);
            best = Some((h, inliers));
        }
    }

    let (h, inliers) = best?;
    if inliers.len() < MIN_CORRESPONDENCES {
        return None;
    }

    let inlier_src: Vec<[f64; 2]> = inliers.iter().map(|&i| src[i]).collect();
    let inlier_dst: Vec<[f64; 2]> = inliers.iter().map(|&i| dst[i]).collect();

    // Keep the refit only if it does not lose consensus.
    let (homography, inliers) = match estimate_homography_dlt(&inlier_src, &inlier_dst) {
        Some(refit) => {
            let refit_inliers = collect_inliers(&refit, src, dst, params.threshold);
            if refit_inliers.len() >= inliers.len() {
                (refit, refit_inliers)
            } else {
                (h, inliers)
            }
        }
        None => (h, inliers),
    };

    Some(RansacFit {
        homography,
        inliers,
        iterations,
    })
}
