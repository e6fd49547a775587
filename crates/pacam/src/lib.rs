//! pacam: pressure-advance calibration from a photo of a printed line pattern.
//!
//! A printer extrudes one short line per candidate pressure-advance (PA) value inside a
//! rectangular outline. A camera on the toolhead photographs the result; this crate
//! turns that photo into the PA value of the smoothest line. The stages are:
//!
//! 1. **Segment** – a [`SegmentationProvider`] separates printed filament from the bed.
//! 2. **Rectify** – the outline is located in the mask, lens distortion and perspective
//!    are removed and the pattern is resampled top-down with lines running vertically.
//! 3. **Extract** – each line's band is scanned row by row for its centreline and
//!    cross-section width.
//! 4. **Score** – residual against a low-order fit plus width variation; lower is
//!    smoother.
//! 5. **Select** – the lowest valid score wins; ties go to the lower PA.
//!
//! # Public API
//! - [`Calibrator`] and [`CalibrationConfig`] as primary entry points
//! - [`CalibrationOrchestrator`] for full runs with capture, segmentation and artifacts
//! - stage components ([`GeometricRectifier`], [`LineExtractor`], [`SmoothnessScorer`],
//!   [`ValueSelector`]) and their result structures
//! - collaborator traits ([`CaptureSource`], [`SegmentationProvider`]) with adapters

mod api;
mod artifacts;
mod capture;
mod config;
mod error;
mod extract;
mod homography;
mod mask;
mod pattern;
mod pipeline;
mod pixelmap;
mod rectify;
mod report;
mod score;
mod segmentation;
mod select;

pub use api::Calibrator;
pub use artifacts::{
    ArtifactStore, RunArtifacts, MASK_FILE, RAW_IMAGE_FILE, RECTIFIED_IMAGE_FILE,
    RECTIFIED_MASK_FILE, REPORT_FILE,
};
pub use capture::{
    CaptureConfig, CaptureMetadata, CaptureOrientation, CaptureSource, FileCapture,
    FrameCapture, HttpSnapshotCapture, RawImage,
};
pub use config::{CalibrationConfig, CameraConfig, RunConfig, CONFIG_SCHEMA_V1};
pub use error::{CalibrationError, ErrorKind, Result};
pub use extract::{ExtractConfig, LineExtractor, LineTrace, TracePoint};
pub use homography::HomographyError;
pub use mask::ForegroundMask;
pub use pattern::{CameraPlacement, PatternConfig, PatternModel};
pub use pipeline::{
    Analysis, CalibrationOutcome, CalibrationOrchestrator, PaDecision, RunState, StageTiming,
    StateMachine, TransitionError,
};
pub use pixelmap::{
    CameraIntrinsics, CameraModel, DivisionModel, LensDistortion, LensMapper, PixelMapper,
    RadialTangentialDistortion, UndistortConfig,
};
pub use rectify::{
    GeometricRectifier, LineAxis, QuadSource, RectificationInfo, RectifiedImage, RectifyConfig,
};
pub use report::{
    FailureReport, LineSummary, PatternSummary, RunReport, SegmentationReport,
    SelectionSummary, REPORT_SCHEMA_V1,
};
pub use score::{
    IncompletePolicy, InvalidReason, RowWindow, ScoreConfig, ScoredLines, SelectionMetric,
    SmoothnessScore, SmoothnessScorer,
};
pub use segmentation::{
    HttpSegmentation, OtsuSegmentation, PrecomputedMask, SegmentationConfig,
    SegmentationError, SegmentationProvider,
};
pub use select::{RankedScore, SelectConfig, SelectionResult, ValueSelector};

#[cfg(test)]
pub(crate) mod test_utils;
