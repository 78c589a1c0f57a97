// THEORY:
// The `pipeline` module composes the pixel-level building blocks into the two
// stages that turn a pair of photos into a change overlay: alignment and
// difference detection. It is the unit of work the execution context runs.
//
// Key architectural principles:
// 1.  **Reference Grid**: Everything is expressed in the reference photo's pixel
//     grid. The current photo is registered onto it, never the other way round,
//     and the overlay always has the reference's dimensions.
// 2.  **Description Based Matching**: The two photos may differ in size. Keypoints
//     are paired by descriptor distance alone, then filtered by the ratio test.
// 3.  **Honest Failure**: Fewer than four surviving matches is an error, never a
//     silent identity transform.
// 4.  **Cooperative Stops**: Cancellation is checked between stages. A stage that
//     has started always runs to completion; its result is simply discarded.

use crate::core_modules::capability::VisionEngine;
use crate::core_modules::difference::{self, OverlayResult, OverlayStyle};
use crate::core_modules::features::{OrbParams, detect_and_compute};
use crate::core_modules::frame::Frame;
use crate::core_modules::homography::{self, Homography, MIN_CORRESPONDENCES, Point, RansacParams};
use crate::core_modules::matcher::{knn_match, ratio_filter};
use crate::core_modules::warp::warp_perspective;
use crate::error::AlignmentError;
use crate::ingest::{DEFAULT_MAX_DIMENSION, DEFAULT_REENCODE_QUALITY, IngestOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for the VisionPipeline, allowing for tunable behavior.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Loaded photos are scaled so their longer side is at most this many pixels.
    pub max_dimension: u32,
    /// JPEG quality of the working copy made at load time. `None` skips the re-encode.
    pub reencode_quality: Option<u8>,
    /// Upper bound on keypoints detected per photo.
    pub max_features: usize,
    pub pyramid_levels: u8,
    pub pyramid_scale: f32,
    /// Minimum brightness step, on the 0-255 scale, for a FAST corner.
    pub fast_threshold: u8,
    /// A match survives only if its distance is below `ratio` times the runner-up's.
    pub ratio: f32,
    /// Reprojection error, in pixels, under which a correspondence is an inlier.
    pub ransac_threshold: f64,
    pub ransac_max_iterations: usize,
    pub ransac_confidence: f64,
    /// Seed of the RANSAC sampler. A fixed seed makes runs reproducible.
    pub ransac_seed: u64,
    /// Luma difference a pixel must exceed to count as changed.
    pub diff_threshold: u8,
    /// RGBA color painted over changed pixels.
    pub highlight: [u8; 4],
    /// Blend weight of the highlight; the reference keeps weight 1.0.
    pub overlay_weight: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let orb = OrbParams::default();
        let ransac = RansacParams::default();
        let style = OverlayStyle::default();
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            reencode_quality: Some(DEFAULT_REENCODE_QUALITY),
            max_features: orb.max_features,
            pyramid_levels: orb.pyramid_levels,
            pyramid_scale: orb.pyramid_scale,
            fast_threshold: orb.fast_threshold,
            ratio: 0.75,
            ransac_threshold: ransac.threshold,
            ransac_max_iterations: ransac.max_iterations,
            ransac_confidence: ransac.confidence,
            ransac_seed: ransac.seed,
            diff_threshold: 30,
            highlight: style.highlight,
            overlay_weight: style.weight,
        }
    }
}

impl PipelineConfig {
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            max_dimension: self.max_dimension,
            reencode_quality: self.reencode_quality,
        }
    }

    pub fn orb_params(&self) -> OrbParams {
        OrbParams {
            max_features: self.max_features,
            pyramid_levels: self.pyramid_levels,
            pyramid_scale: self.pyramid_scale,
            fast_threshold: self.fast_threshold,
        }
    }

    pub fn ransac_params(&self) -> RansacParams {
        RansacParams {
            threshold: self.ransac_threshold,
            max_iterations: self.ransac_max_iterations,
            confidence: self.ransac_confidence,
            seed: self.ransac_seed,
        }
    }

    pub fn overlay_style(&self) -> OverlayStyle {
        OverlayStyle {
            highlight: self.highlight,
            weight: self.overlay_weight,
        }
    }
}

/// Coarse progress of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Aligning,
    Diffing,
}

/// The current photo registered onto the reference grid.
#[derive(Debug, Clone)]
pub struct Alignment {
    /// Maps current-photo coordinates to reference coordinates.
    pub homography: Homography,
    /// The current photo resampled to the reference's dimensions.
    pub warped: Frame,
    /// Correspondences consistent with `homography`.
    pub inliers: usize,
}

/// The main, top-level struct for one alignment-and-difference run.
pub struct VisionPipeline {
    config: PipelineConfig,
    engine: Arc<VisionEngine>,
}

impl VisionPipeline {
    pub fn new(config: PipelineConfig, engine: Arc<VisionEngine>) -> Self {
        Self { config, engine }
    }

    /// Runs both stages. Returns `Ok(None)` if `cancel` fired between them.
    pub fn run(
        &self,
        reference: &Frame,
        current: &Frame,
        cancel: &CancellationToken,
        mut on_stage: impl FnMut(PipelineStage),
    ) -> Result<Option<OverlayResult>, AlignmentError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        on_stage(PipelineStage::Aligning);
        let alignment = self.align(reference, current)?;

        if cancel.is_cancelled() {
            return Ok(None);
        }
        on_stage(PipelineStage::Diffing);
        let overlay = self.detect_differences(reference, &alignment.warped);

        Ok((!cancel.is_cancelled()).then_some(overlay))
    }

    /// Registers `current` onto `reference`.
    pub fn align(&self, reference: &Frame, current: &Frame) -> Result<Alignment, AlignmentError> {
        self.engine.install(|| {
            let params = self.config.orb_params();
            let pattern = self.engine.pattern();
            let (reference_features, current_features) = rayon::join(
                || detect_and_compute(&reference.to_gray(), &params, pattern),
                || detect_and_compute(&current.to_gray(), &params, pattern),
            );
            debug!(
                reference = reference_features.len(),
                current = current_features.len(),
                "detected keypoints"
            );

            let knn = knn_match(reference_features.descriptors(), current_features.descriptors());
            let matches = ratio_filter(&knn, self.config.ratio);
            debug!(candidates = knn.len(), accepted = matches.len(), "ratio test");
            if matches.len() < MIN_CORRESPONDENCES {
                return Err(AlignmentError::InsufficientMatches {
                    found: matches.len(),
                    required: MIN_CORRESPONDENCES,
                });
            }

            let (src, dst): (Vec<Point>, Vec<Point>) = matches
                .iter()
                .map(|m| {
                    let from = current_features.keypoints()[m.train_idx];
                    let to = reference_features.keypoints()[m.query_idx];
                    ((from.x as f64, from.y as f64), (to.x as f64, to.y as f64))
                })
                .unzip();

            let estimate = homography::find_homography(&src, &dst, &self.config.ransac_params())?;
            debug!(inliers = estimate.inlier_count(), of = matches.len(), "homography estimated");

            let warped = warp_perspective(current, &estimate.homography, reference.width(), reference.height())?;
            Ok(Alignment {
                inliers: estimate.inlier_count(),
                homography: estimate.homography,
                warped,
            })
        })
    }

    /// Compares the warped photo against the reference and paints the changes.
    pub fn detect_differences(&self, reference: &Frame, warped: &Frame) -> OverlayResult {
        self.engine.install(|| {
            let (reference_gray, warped_gray) = rayon::join(|| reference.to_gray(), || warped.to_gray());
            let mask = difference::diff_mask(&reference_gray, &warped_gray, self.config.diff_threshold);
            let overlay = difference::composite(reference, &mask, &self.config.overlay_style());
            debug!(changed = overlay.changed_pixels, "difference overlay composed");
            overlay
        })
    }
}
