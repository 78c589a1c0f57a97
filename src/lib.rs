// THEORY:
// This file is the main entry point for the `crack_vision` library crate.
// Given two photographs of the same wall, taken at different times and from
// slightly different positions, it registers the newer photo onto the older one
// and paints the pixels that changed, so new or widened cracks stand out.
//
// The primary interface is the `SessionController`: hand it a pair of image
// locators and it loads, aligns and diffs them on a background context, then
// calls back exactly once with the result. The `VisionPipeline` is exposed for
// callers that already hold decoded frames and want to run the stages directly.
// The pixel-level building blocks live in `core_modules`.

pub mod core_modules;
pub mod error;
pub mod execution;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod schedule;
pub mod session;

pub use core_modules::capability::{CapabilityLoader, EngineConfig, VisionEngine};
pub use core_modules::difference::OverlayResult;
pub use core_modules::frame::Frame;
pub use error::{AlignerError, AlignmentError, AlignmentFailure, CapabilityLoadError, LoadError};
pub use ingest::{ImageLocator, IngestOptions};
pub use pipeline::{PipelineConfig, VisionPipeline};
pub use session::{
    AlignmentControl, ControllerConfig, PriorityMode, SessionController, SessionOutput, SessionStatus,
};
