// THEORY:
// The `features` module turns a grayscale image into a `FeatureSet`: a list of
// distinctive, repeatable locations (keypoints) and one binary descriptor for each.
// It is an ORB-style detector, so features survive rotation and moderate zoom,
// which is what we need to register two handheld photographs of the same wall.
//
// Key architectural principles & algorithm steps:
// 1.  **Scale Pyramid**: The image is repeatedly downscaled by `pyramid_scale`.
//     Detecting on every level makes the same physical corner findable whether the
//     second photo was taken closer or further away.
// 2.  **FAST-9 Corners**: A pixel is a candidate when 9 contiguous pixels on the
//     16-pixel Bresenham circle around it are all brighter or all darker than the
//     center by `fast_threshold`.
// 3.  **Harris Ranking**: Candidates are scored by the Harris corner measure and
//     thinned with 3x3 non-maximum suppression. Each level keeps a share of the
//     global budget that shrinks geometrically with the level's area.
// 4.  **Orientation**: The intensity centroid of a circular patch gives each
//     keypoint an angle. Descriptors are sampled in that rotated frame.
// 5.  **Rotated BRIEF**: The descriptor is 256 intensity comparisons between pairs
//     of points from a fixed `SamplingPattern`, taken on a smoothed copy of the level.
//     Descriptors are compared by Hamming distance.

use image::{GrayImage, imageops};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::cmp::Ordering;

pub const DESCRIPTOR_BYTES: usize = 32;
const DESCRIPTOR_BITS: usize = DESCRIPTOR_BYTES * 8;

/// Sampling pairs stay within this radius before rotation.
const PATTERN_RADIUS: f32 = 13.0;
/// Radius of the circular patch used for the intensity centroid.
const ORIENTATION_RADIUS: i32 = 15;
/// Keypoints closer than this to the level border are discarded, so every
/// descriptor and orientation patch lies fully inside the image.
const EDGE_THRESHOLD: u32 = 19;
const HARRIS_BLOCK_RADIUS: i32 = 3;
const HARRIS_K: f32 = 0.04;
const SMOOTHING_SIGMA: f32 = 2.0;
const FAST_ARC_LENGTH: usize = 9;

const FAST_CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// A 256-bit binary descriptor.
pub type Descriptor = [u8; DESCRIPTOR_BYTES];

/// A detected feature location, in level-0 pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Orientation in radians.
    pub angle: f32,
    /// Downscale factor of the pyramid level the keypoint was found on.
    pub scale: f32,
    /// Harris corner response; higher is stronger.
    pub response: f32,
    pub octave: u8,
}

/// Keypoints of one image, each paired with its descriptor.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    fn push(&mut self, keypoint: Keypoint, descriptor: Descriptor) {
        self.keypoints.push(keypoint);
        self.descriptors.push(descriptor);
    }
}

/// The fixed list of point pairs compared by every descriptor.
///
/// Pairs are drawn from an isotropic Gaussian around the keypoint (sigma of a
/// fifth of the patch width) and clipped to `PATTERN_RADIUS`. The same seed
/// always yields the same pattern.
#[derive(Debug, Clone)]
pub struct SamplingPattern {
    pairs: Vec<[(f32, f32); 2]>,
}

impl SamplingPattern {
    pub fn generate(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let sigma = (2.0 * PATTERN_RADIUS + 1.0) / 5.0;
        let mut sample = move || -> (f32, f32) {
            // Box-Muller
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.r#gen();
            let r = (-2.0 * u1.ln()).sqrt() * sigma;
            let theta = std::f32::consts::TAU * u2;
            (
                (r * theta.cos()).clamp(-PATTERN_RADIUS, PATTERN_RADIUS),
                (r * theta.sin()).clamp(-PATTERN_RADIUS, PATTERN_RADIUS),
            )
        };
        let pairs = (0..DESCRIPTOR_BITS).map(|_| [sample(), sample()]).collect();
        Self { pairs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Tunables for the detector.
#[derive(Debug, Clone)]
pub struct OrbParams {
    pub max_features: usize,
    pub pyramid_levels: u8,
    pub pyramid_scale: f32,
    pub fast_threshold: u8,
}

impl Default for OrbParams {
    fn default() -> Self {
        Self {
            max_features: 2000,
            pyramid_levels: 8,
            pyramid_scale: 1.2,
            fast_threshold: 20,
        }
    }
}

/// Number of set bits that differ between two descriptors.
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Detects keypoints on every pyramid level and computes their descriptors.
///
/// Runs row-parallel on the current rayon pool; callers install it into the
/// engine's pool.
pub fn detect_and_compute(gray: &GrayImage, params: &OrbParams, pattern: &SamplingPattern) -> FeatureSet {
    let levels = build_pyramid(gray, params);
    let budgets = level_budgets(params.max_features, levels.len(), params.pyramid_scale);

    let mut candidates: Vec<(Keypoint, Descriptor)> = Vec::new();
    for (octave, ((level, scale), budget)) in levels.iter().zip(budgets).enumerate() {
        if budget == 0 {
            continue;
        }
        candidates.extend(features_on_level(level, *scale, octave as u8, budget, params, pattern));
    }

    candidates.sort_by(|a, b| b.0.response.partial_cmp(&a.0.response).unwrap_or(Ordering::Equal));
    candidates.truncate(params.max_features);

    let mut features = FeatureSet::default();
    for (keypoint, descriptor) in candidates {
        features.push(keypoint, descriptor);
    }
    features
}

/// Level 0 is the input itself; each further level shrinks by `pyramid_scale`.
/// Stops early once a level is too small to hold a single keypoint.
fn build_pyramid(gray: &GrayImage, params: &OrbParams) -> Vec<(GrayImage, f32)> {
    let min_side = 2 * EDGE_THRESHOLD + 1;
    let mut pyramid = Vec::with_capacity(params.pyramid_levels as usize);
    if gray.width() < min_side || gray.height() < min_side {
        return pyramid;
    }
    pyramid.push((gray.clone(), 1.0));

    let mut scale = 1.0f32;
    for _ in 1..params.pyramid_levels.max(1) {
        scale *= params.pyramid_scale;
        let width = (gray.width() as f32 / scale).round() as u32;
        let height = (gray.height() as f32 / scale).round() as u32;
        if width < min_side || height < min_side {
            break;
        }
        let level = imageops::resize(gray, width, height, imageops::FilterType::Triangle);
        pyramid.push((level, scale));
    }
    pyramid
}

/// Splits `total` across `levels` geometrically, level 0 receiving the most.
fn level_budgets(total: usize, levels: usize, scale: f32) -> Vec<usize> {
    if levels == 0 {
        return Vec::new();
    }
    let factor = 1.0 / scale as f64;
    let first = if (factor - 1.0).abs() < f64::EPSILON {
        total as f64 / levels as f64
    } else {
        total as f64 * (1.0 - factor) / (1.0 - factor.powi(levels as i32))
    };

    let mut budgets = Vec::with_capacity(levels);
    let mut assigned = 0usize;
    let mut share = first;
    for _ in 0..levels - 1 {
        let n = (share.round() as usize).min(total - assigned);
        budgets.push(n);
        assigned += n;
        share *= factor;
    }
    budgets.push(total - assigned);
    budgets
}

fn features_on_level(
    level: &GrayImage,
    scale: f32,
    octave: u8,
    budget: usize,
    params: &OrbParams,
    pattern: &SamplingPattern,
) -> Vec<(Keypoint, Descriptor)> {
    let (width, height) = level.dimensions();
    let corners = detect_fast(level, params.fast_threshold);

    // Dense response map so suppression can look at neighbors in O(1).
    let mut response_map = vec![0.0f32; (width * height) as usize];
    let scored: Vec<(u32, u32, f32)> = corners
        .par_iter()
        .map(|&(x, y)| (x, y, harris_response(level, x, y)))
        .collect();
    for &(x, y, r) in &scored {
        response_map[(y * width + x) as usize] = r;
    }

    let mut kept: Vec<(u32, u32, f32)> = scored
        .into_iter()
        .filter(|&(x, y, r)| r > 0.0 && is_local_maximum(&response_map, width, x, y, r))
        .collect();
    kept.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));
    kept.truncate(budget);

    let smoothed = imageops::blur(level, SMOOTHING_SIGMA);
    kept.par_iter()
        .map(|&(x, y, response)| {
            let angle = intensity_centroid_angle(level, x, y);
            let descriptor = describe(&smoothed, x, y, angle, pattern);
            let keypoint = Keypoint {
                x: x as f32 * scale,
                y: y as f32 * scale,
                angle,
                scale,
                response,
                octave,
            };
            (keypoint, descriptor)
        })
        .collect()
}

/// FAST-9 segment test, evaluated on rows in parallel.
fn detect_fast(level: &GrayImage, threshold: u8) -> Vec<(u32, u32)> {
    let (width, height) = level.dimensions();
    if width <= 2 * EDGE_THRESHOLD || height <= 2 * EDGE_THRESHOLD {
        return Vec::new();
    }
    (EDGE_THRESHOLD..height - EDGE_THRESHOLD)
        .into_par_iter()
        .flat_map_iter(|y| {
            (EDGE_THRESHOLD..width - EDGE_THRESHOLD)
                .filter(move |&x| is_fast_corner(level, x, y, threshold))
                .map(move |x| (x, y))
        })
        .collect()
}

fn is_fast_corner(level: &GrayImage, x: u32, y: u32, threshold: u8) -> bool {
    let center = level.get_pixel(x, y)[0];
    let bright = center.saturating_add(threshold);
    let dark = center.saturating_sub(threshold);
    let at = |i: usize| {
        let (dx, dy) = FAST_CIRCLE[i];
        level.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0]
    };

    // Any 9-pixel arc covers at least two of the four compass points.
    let compass = [at(0), at(4), at(8), at(12)];
    let bright_hits = compass.iter().filter(|&&p| p > bright).count();
    let dark_hits = compass.iter().filter(|&&p| p < dark).count();
    if bright_hits < 2 && dark_hits < 2 {
        return false;
    }

    let mut bright_run = 0;
    let mut dark_run = 0;
    for i in 0..FAST_CIRCLE.len() + FAST_ARC_LENGTH {
        let p = at(i % FAST_CIRCLE.len());
        if p > bright {
            bright_run += 1;
            dark_run = 0;
        } else if p < dark {
            dark_run += 1;
            bright_run = 0;
        } else {
            bright_run = 0;
            dark_run = 0;
        }
        if bright_run >= FAST_ARC_LENGTH || dark_run >= FAST_ARC_LENGTH {
            return true;
        }
    }
    false
}

/// Harris measure over a 7x7 block of central-difference gradients.
fn harris_response(level: &GrayImage, x: u32, y: u32) -> f32 {
    let value = |px: i32, py: i32| level.get_pixel(px as u32, py as u32)[0] as f32;
    let (mut sxx, mut syy, mut sxy) = (0.0f32, 0.0f32, 0.0f32);
    for dy in -HARRIS_BLOCK_RADIUS..=HARRIS_BLOCK_RADIUS {
        for dx in -HARRIS_BLOCK_RADIUS..=HARRIS_BLOCK_RADIUS {
            let px = x as i32 + dx;
            let py = y as i32 + dy;
            let ix = (value(px + 1, py) - value(px - 1, py)) * 0.5;
            let iy = (value(px, py + 1) - value(px, py - 1)) * 0.5;
            sxx += ix * ix;
            syy += iy * iy;
            sxy += ix * iy;
        }
    }
    let det = sxx * syy - sxy * sxy;
    let trace = sxx + syy;
    det - HARRIS_K * trace * trace
}

fn is_local_maximum(map: &[f32], width: u32, x: u32, y: u32, response: f32) -> bool {
    for dy in -1i32..=1 {
        for dx in -1i32..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = (x as i32 + dx) as u32;
            let ny = (y as i32 + dy) as u32;
            let neighbor = map[(ny * width + nx) as usize];
            // Ties go to the earlier pixel in scan order.
            if neighbor > response || (neighbor == response && (dy < 0 || (dy == 0 && dx < 0))) {
                return false;
            }
        }
    }
    true
}

fn intensity_centroid_angle(level: &GrayImage, x: u32, y: u32) -> f32 {
    let (mut m01, mut m10) = (0.0f32, 0.0f32);
    let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let intensity = level.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0] as f32;
            m10 += dx as f32 * intensity;
            m01 += dy as f32 * intensity;
        }
    }
    m01.atan2(m10)
}

fn describe(smoothed: &GrayImage, x: u32, y: u32, angle: f32, pattern: &SamplingPattern) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let max_x = smoothed.width() as i32 - 1;
    let max_y = smoothed.height() as i32 - 1;
    let sample = |(px, py): (f32, f32)| {
        let rx = (px * cos - py * sin).round() as i32;
        let ry = (px * sin + py * cos).round() as i32;
        let sx = (x as i32 + rx).clamp(0, max_x) as u32;
        let sy = (y as i32 + ry).clamp(0, max_y) as u32;
        smoothed.get_pixel(sx, sy)[0]
    };

    let mut descriptor = [0u8; DESCRIPTOR_BYTES];
    for (bit, [a, b]) in pattern.pairs.iter().enumerate() {
        if sample(*a) < sample(*b) {
            descriptor[bit / 8] |= 1 << (bit % 8);
        }
    }
    descriptor
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// Deterministic texture of overlapping rectangles on a mid-gray ground.
    pub(crate) fn textured(width: u32, height: u32, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut img = GrayImage::from_pixel(width, height, Luma([128]));
        for _ in 0..60 {
            let w = rng.gen_range(8..width / 4);
            let h = rng.gen_range(8..height / 4);
            let x0 = rng.gen_range(0..width - w);
            let y0 = rng.gen_range(0..height - h);
            let v: u8 = rng.r#gen();
            for y in y0..y0 + h {
                for x in x0..x0 + w {
                    img.put_pixel(x, y, Luma([v]));
                }
            }
        }
        img
    }

    #[test]
    fn hamming_counts_differing_bits() {
        let a = [0u8; DESCRIPTOR_BYTES];
        let mut b = [0u8; DESCRIPTOR_BYTES];
        b[0] = 0b1011;
        b[31] = 0xFF;
        assert_eq!(hamming(&a, &b), 11);
        assert_eq!(hamming(&b, &b), 0);
    }

    #[test]
    fn pattern_is_deterministic_and_bounded() {
        let a = SamplingPattern::generate(7);
        let b = SamplingPattern::generate(7);
        assert_eq!(a.len(), 256);
        for (pa, pb) in a.pairs.iter().zip(b.pairs.iter()) {
            assert_eq!(pa, pb);
            for (px, py) in pa {
                assert!(px.abs() <= PATTERN_RADIUS && py.abs() <= PATTERN_RADIUS);
            }
        }
    }

    #[test]
    fn budgets_sum_to_total_and_decrease() {
        let budgets = level_budgets(2000, 8, 1.2);
        assert_eq!(budgets.len(), 8);
        assert_eq!(budgets.iter().sum::<usize>(), 2000);
        assert!(budgets[0] > budgets[1]);
        assert!(budgets[1] > budgets[6]);
    }

    #[test]
    fn flat_image_has_no_features() {
        let flat = GrayImage::from_pixel(200, 150, Luma([90]));
        let features = detect_and_compute(&flat, &OrbParams::default(), &SamplingPattern::generate(1));
        assert!(features.is_empty());
    }

    #[test]
    fn tiny_image_has_no_features() {
        let tiny = GrayImage::from_fn(32, 32, |x, y| Luma([if (x / 4 + y / 4) % 2 == 0 { 20 } else { 220 }]));
        let features = detect_and_compute(&tiny, &OrbParams::default(), &SamplingPattern::generate(1));
        assert!(features.is_empty());
    }

    #[test]
    fn textured_image_yields_bounded_features() {
        let img = textured(320, 240, 11);
        let params = OrbParams { max_features: 150, ..OrbParams::default() };
        let features = detect_and_compute(&img, &params, &SamplingPattern::generate(1));
        assert!(!features.is_empty());
        assert!(features.len() <= 150);
        assert_eq!(features.keypoints().len(), features.descriptors().len());
        for kp in features.keypoints() {
            assert!(kp.x >= 0.0 && kp.x < 320.0);
            assert!(kp.y >= 0.0 && kp.y < 240.0);
        }
    }

    #[test]
    fn detection_is_repeatable() {
        let img = textured(240, 180, 5);
        let pattern = SamplingPattern::generate(9);
        let a = detect_and_compute(&img, &OrbParams::default(), &pattern);
        let b = detect_and_compute(&img, &OrbParams::default(), &pattern);
        assert_eq!(a.keypoints(), b.keypoints());
        assert_eq!(a.descriptors(), b.descriptors());
    }
}
