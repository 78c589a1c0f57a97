//! Error types for the alignment engine.
//!
//! Errors are grouped by the stage that raised them. Every one of them is
//! recovered at the session level: the session ends in `Error` and its
//! consumer receives `None`.

use std::fmt;
use thiserror::Error;

/// Why an alignment attempt could not produce a usable homography.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlignmentFailure {
    InsufficientMatches,
    DegenerateHomography,
}

impl fmt::Display for AlignmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentFailure::InsufficientMatches => write!(f, "insufficient-matches"),
            AlignmentFailure::DegenerateHomography => write!(f, "degenerate-homography"),
        }
    }
}

/// Failures of the geometric registration stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlignmentError {
    /// Fewer accepted correspondences than a homography needs.
    #[error("insufficient correspondences: {found} accepted, {required} required")]
    InsufficientMatches { found: usize, required: usize },

    /// RANSAC found no consensus, or the best model is not invertible.
    #[error("degenerate homography")]
    DegenerateHomography,
}

impl AlignmentError {
    pub fn reason(&self) -> AlignmentFailure {
        match self {
            AlignmentError::InsufficientMatches { .. } => AlignmentFailure::InsufficientMatches,
            AlignmentError::DegenerateHomography => AlignmentFailure::DegenerateHomography,
        }
    }
}

/// Failures while fetching, decoding or re-encoding a source image.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {locator}: {source}")]
    Read {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch {locator}: {message}")]
    Fetch { locator: String, message: String },

    #[error("failed to decode {locator}: {source}")]
    Decode {
        locator: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to re-encode working copy: {0}")]
    Encode(#[source] image::ImageError),

    /// The blocking decode task died before returning.
    #[error("image worker failed: {0}")]
    Worker(String),

    #[error("image locator is empty")]
    Empty,
}

/// The vision engine could not be made available.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("vision engine unavailable: {0}")]
pub struct CapabilityLoadError(pub String);

/// Umbrella error delivered to the session controller.
#[derive(Debug, Error)]
pub enum AlignerError {
    #[error(transparent)]
    CapabilityLoad(#[from] CapabilityLoadError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("alignment failed ({reason}): {0}", reason = .0.reason())]
    Alignment(#[from] AlignmentError),

    /// Internal fault inside the isolated execution context.
    #[error("execution context failed: {0}")]
    ExecutionContext(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_error_exposes_reason_code() {
        let err = AlignmentError::InsufficientMatches { found: 3, required: 4 };
        assert_eq!(err.reason(), AlignmentFailure::InsufficientMatches);
        assert_eq!(err.reason().to_string(), "insufficient-matches");
        assert_eq!(
            AlignmentError::DegenerateHomography.reason().to_string(),
            "degenerate-homography"
        );
    }

    #[test]
    fn aligner_error_message_carries_reason() {
        let err: AlignerError = AlignmentError::DegenerateHomography.into();
        assert_eq!(
            err.to_string(),
            "alignment failed (degenerate-homography): degenerate homography"
        );
    }
}
