//! Error types shared by the calibration pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::homography::HomographyError;
use crate::segmentation::SegmentationError;

/// Failure of a calibration stage.
///
/// Every variant terminates the current run; none carries state into the next one.
/// Incomplete traces are not an error: they surface as
/// [`LineTrace::incomplete`](crate::LineTrace::incomplete) and feed the scorer.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Invalid pattern or pipeline parameters.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The printed outline rectangle could not be located in the mask.
    #[error("calibration pattern not found: {0}")]
    PatternNotFound(String),

    /// Every line scored invalid, or too few valid lines to trust a selection.
    #[error("no valid line: {valid} of {total} lines scorable (need {required})")]
    NoValidLine {
        valid: usize,
        total: usize,
        required: usize,
    },

    /// The segmentation collaborator failed or timed out.
    #[error("segmentation failed: {0}")]
    Network(#[from] SegmentationError),

    /// The outer run deadline expired.
    #[error("run timed out after {elapsed_ms} ms (budget {budget_ms} ms)")]
    Timeout { elapsed_ms: u64, budget_ms: u64 },

    /// The capture collaborator did not deliver an image.
    #[error("capture failed: {0}")]
    Capture(String),

    /// Writing or encoding a run artifact failed.
    #[error("artifact error: {0}")]
    Artifact(String),
}

impl CalibrationError {
    /// Serializable kind tag used in run reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::PatternNotFound(_) => ErrorKind::PatternNotFound,
            Self::NoValidLine { .. } => ErrorKind::NoValidLine,
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Capture(_) => ErrorKind::Capture,
            Self::Artifact(_) => ErrorKind::Artifact,
        }
    }
}

impl From<HomographyError> for CalibrationError {
    fn from(err: HomographyError) -> Self {
        Self::PatternNotFound(format!("perspective transform: {err}"))
    }
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        Self::Artifact(err.to_string())
    }
}

impl From<image::ImageError> for CalibrationError {
    fn from(err: image::ImageError) -> Self {
        Self::Artifact(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Artifact(err.to_string())
    }
}

/// Error category recorded in `Failed(..)` states and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    PatternNotFound,
    NoValidLine,
    Network,
    Timeout,
    Capture,
    Artifact,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::PatternNotFound => "pattern_not_found",
            Self::NoValidLine => "no_valid_line",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Capture => "capture",
            Self::Artifact => "artifact",
        };
        f.write_str(name)
    }
}

pub type Result<T, E = CalibrationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let err = CalibrationError::NoValidLine {
            valid: 0,
            total: 21,
            required: 1,
        };
        assert_eq!(err.kind(), ErrorKind::NoValidLine);
        assert!(err.to_string().contains("0 of 21"));

        let err: CalibrationError = SegmentationError::Timeout { timeout_ms: 500 }.into();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PatternNotFound).unwrap();
        assert_eq!(json, "\"pattern_not_found\"");
        assert_eq!(ErrorKind::PatternNotFound.to_string(), "pattern_not_found");
    }
}
