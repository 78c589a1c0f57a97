// THEORY:
// A homography is the 3x3 projective transform between two photos of a plane. A
// wall photographed twice from slightly different positions is, to a good
// approximation, such a plane, so one homography registers the two photos.
//
// Key architectural principles & algorithm steps:
// 1.  **Normalized DLT**: Each correspondence contributes two linear equations in
//     the nine entries of H. Points are first shifted to their centroid and scaled
//     to an average distance of sqrt(2) (Hartley normalization); the solution is the
//     singular vector of the smallest singular value of the stacked system.
// 2.  **RANSAC**: Matches always contain outliers. Random minimal samples of four
//     correspondences propose models; the model agreeing with the most
//     correspondences (reprojection error under the threshold) wins. The number of
//     iterations adapts to the best inlier ratio seen so far.
// 3.  **Refinement**: The winner is re-estimated from all of its inliers.
// 4.  **Undefined Is an Outcome**: When no model can be found, or the result cannot
//     be inverted, estimation returns `DegenerateHomography`. It never falls back
//     to identity.

use crate::error::AlignmentError;
use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;

pub const MIN_CORRESPONDENCES: usize = 4;

const EPS: f64 = 1e-10;
const COLLINEAR_EPS: f64 = 1e-6;

pub type Point = (f64, f64);

/// A projective transform `p' ~ H p`, scaled so that `H[2][2] == 1` whenever
/// that entry is not zero.
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

    /// Returns `None` for non-finite or singular matrices.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Option<Self> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let matrix = if matrix[(2, 2)].abs() > EPS {
            matrix / matrix[(2, 2)]
        } else {
            matrix
        };
        if matrix.determinant().abs() < EPS {
            return None;
        }
        Some(Self { matrix })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Maps a point; `None` if it lands on the line at infinity.
    pub fn project(&self, (x, y): Point) -> Option<Point> {
        let v = self.matrix * Vector3::new(x, y, 1.0);
        let w = v[2];
        if !w.is_finite() || w.abs() < EPS {
            return None;
        }
        let p = (v[0] / w, v[1] / w);
        (p.0.is_finite() && p.1.is_finite()).then_some(p)
    }

    pub fn inverse(&self) -> Option<Self> {
        self.matrix.try_inverse().and_then(Self::from_matrix)
    }

    fn reprojection_error_sq(&self, src: Point, dst: Point) -> f64 {
        match self.project(src) {
            Some((x, y)) => (x - dst.0).powi(2) + (y - dst.1).powi(2),
            None => f64::INFINITY,
        }
    }
}

/// RANSAC tunables.
#[derive(Debug, Clone)]
pub struct RansacParams {
    /// Maximum reprojection error, in pixels, for a correspondence to count as an inlier.
    pub threshold: f64,
    pub max_iterations: usize,
    /// Desired probability that at least one sample was outlier-free.
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            max_iterations: 2000,
            confidence: 0.995,
            seed: 0x5EED,
        }
    }
}

/// The consensus model and which correspondences support it.
#[derive(Debug, Clone)]
pub struct RansacEstimate {
    pub homography: Homography,
    pub inliers: Vec<bool>,
}

impl RansacEstimate {
    pub fn inlier_count(&self) -> usize {
        self.inliers.iter().filter(|&&i| i).count()
    }
}

/// Robustly estimates the homography taking `src[i]` to `dst[i]`.
pub fn find_homography(src: &[Point], dst: &[Point], params: &RansacParams) -> Result<RansacEstimate, AlignmentError> {
    let n = src.len().min(dst.len());
    if n < MIN_CORRESPONDENCES {
        return Err(AlignmentError::InsufficientMatches {
            found: n,
            required: MIN_CORRESPONDENCES,
        });
    }

    let threshold_sq = params.threshold * params.threshold;
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<(Homography, usize)> = None;
    let mut iterations = params.max_iterations;
    let mut i = 0;

    while i < iterations {
        i += 1;
        let sample = index::sample(&mut rng, n, MIN_CORRESPONDENCES);
        let s_src: Vec<Point> = sample.iter().map(|k| src[k]).collect();
        let s_dst: Vec<Point> = sample.iter().map(|k| dst[k]).collect();
        if has_collinear_triple(&s_src) || has_collinear_triple(&s_dst) {
            continue;
        }
        let Some(model) = solve_dlt(&s_src, &s_dst) else {
            continue;
        };

        let count = (0..n)
            .filter(|&k| model.reprojection_error_sq(src[k], dst[k]) < threshold_sq)
            .count();
        if best.is_none_or(|(_, c)| count > c) {
            best = Some((model, count));
            iterations = adaptive_iterations(count, n, params.confidence, params.max_iterations);
        }
    }

    let Some((model, count)) = best else {
        return Err(AlignmentError::DegenerateHomography);
    };
    if count < MIN_CORRESPONDENCES {
        return Err(AlignmentError::DegenerateHomography);
    }

    let inliers_of = |h: &Homography| -> Vec<bool> {
        (0..n).map(|k| h.reprojection_error_sq(src[k], dst[k]) < threshold_sq).collect()
    };

    let mut inliers = inliers_of(&model);
    let mut homography = model;
    let in_src: Vec<Point> = (0..n).filter(|&k| inliers[k]).map(|k| src[k]).collect();
    let in_dst: Vec<Point> = (0..n).filter(|&k| inliers[k]).map(|k| dst[k]).collect();
    if let Some(refined) = solve_dlt(&in_src, &in_dst) {
        let refined_inliers = inliers_of(&refined);
        let refined_count = refined_inliers.iter().filter(|&&b| b).count();
        if refined_count >= count {
            homography = refined;
            inliers = refined_inliers;
        }
    }

    if homography.inverse().is_none() {
        return Err(AlignmentError::DegenerateHomography);
    }
    Ok(RansacEstimate { homography, inliers })
}

fn adaptive_iterations(inliers: usize, total: usize, confidence: f64, max_iterations: usize) -> usize {
    let w = inliers as f64 / total as f64;
    let p_good = w.powi(MIN_CORRESPONDENCES as i32);
    if p_good >= 1.0 - f64::EPSILON {
        return 1;
    }
    if p_good <= f64::EPSILON {
        return max_iterations;
    }
    let needed = (1.0 - confidence).ln() / (1.0 - p_good).ln();
    if !needed.is_finite() {
        return max_iterations;
    }
    (needed.ceil() as usize).clamp(1, max_iterations)
}

fn has_collinear_triple(points: &[Point]) -> bool {
    let n = points.len();
    for a in 0..n {
        for b in a + 1..n {
            for c in b + 1..n {
                let (p, q, r) = (points[a], points[b], points[c]);
                let area = (q.0 - p.0) * (r.1 - p.1) - (q.1 - p.1) * (r.0 - p.0);
                let scale = ((q.0 - p.0).hypot(q.1 - p.1)) * ((r.0 - p.0).hypot(r.1 - p.1));
                if area.abs() <= COLLINEAR_EPS * scale.max(1.0) {
                    return true;
                }
            }
        }
    }
    false
}

/// Similarity transform moving the centroid to the origin with mean distance sqrt(2).
fn normalization(points: &[Point]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let (cx, cy) = points.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
    let (cx, cy) = (cx / n, cy / n);
    let mean_dist = points.iter().map(|p| (p.0 - cx).hypot(p.1 - cy)).sum::<f64>() / n;
    if mean_dist < EPS {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

fn apply(t: &Matrix3<f64>, p: Point) -> Point {
    let v = t * Vector3::new(p.0, p.1, 1.0);
    (v[0] / v[2], v[1] / v[2])
}

/// Direct linear transform on normalized coordinates.
fn solve_dlt(src: &[Point], dst: &[Point]) -> Option<Homography> {
    if src.len() < MIN_CORRESPONDENCES || src.len() != dst.len() {
        return None;
    }
    let t_src = normalization(src)?;
    let t_dst = normalization(dst)?;

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (s, d) in src.iter().zip(dst.iter()) {
        let (x, y) = apply(&t_src, *s);
        let (u, v) = apply(&t_dst, *d);
        let r1 = SVector::<f64, 9>::from_row_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]);
        let r2 = SVector::<f64, 9>::from_row_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
        ata += r1 * r1.transpose();
        ata += r2 * r2.transpose();
    }

    let svd = ata.svd(false, true);
    let v_t = svd.v_t?;
    let (smallest, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    let h = v_t.row(smallest);
    let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst.try_inverse()?;
    Homography::from_matrix(t_dst_inv * normalized * t_src)
}
