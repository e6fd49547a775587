//! High-level calibration API.
//!
//! [`Calibrator`] is the primary entry point. It wraps a validated
//! [`CalibrationConfig`] and offers the common ways of running the pipeline: on an
//! in-memory photo and mask, on files, or as a full orchestrated run with capture and
//! segmentation collaborators.

use std::path::Path;

use crate::capture::{CaptureSource, FileCapture, RawImage};
use crate::config::CalibrationConfig;
use crate::error::{CalibrationError, Result};
use crate::mask::ForegroundMask;
use crate::pattern::PatternModel;
use crate::pipeline::{Analysis, CalibrationOrchestrator, CalibrationOutcome};
use crate::segmentation::{PrecomputedMask, SegmentationProvider};

/// Primary calibration interface.
///
/// Create once, calibrate many prints.
///
/// # Examples
///
/// ```no_run
/// use pacam::{CalibrationConfig, Calibrator};
/// use std::path::Path;
///
/// let calibrator = Calibrator::new(CalibrationConfig::default()).unwrap();
/// let analysis = calibrator
///     .analyze_files(Path::new("photo.jpg"), Path::new("photo_out.png"))
///     .unwrap();
/// println!("Best line: {}", analysis.selection.index + 1);
/// println!("Best pressure advance value: {}", analysis.selection.pa_value);
/// ```
#[derive(Debug, Clone)]
pub struct Calibrator {
    orchestrator: CalibrationOrchestrator,
}

impl Calibrator {
    /// Validate `config` and build the pipeline.
    pub fn new(config: CalibrationConfig) -> Result<Self> {
        Ok(Self {
            orchestrator: CalibrationOrchestrator::new(config)?,
        })
    }

    /// Load a `pacam.config.v1` JSON file and build the pipeline.
    pub fn from_config_file(path: &Path) -> Result<Self> {
        Self::new(CalibrationConfig::from_json_file(path)?)
    }

    pub fn config(&self) -> &CalibrationConfig {
        self.orchestrator.config()
    }

    pub fn pattern(&self) -> &PatternModel {
        self.orchestrator.pattern()
    }

    pub fn orchestrator(&self) -> &CalibrationOrchestrator {
        &self.orchestrator
    }

    /// Run rectification, extraction, scoring and selection on a photo and its mask.
    pub fn analyze(&self, raw: &RawImage, mask: &ForegroundMask) -> Result<Analysis> {
        self.orchestrator.analyze(raw, mask)
    }

    /// Like [`analyze`](Self::analyze), reading the photo and a cut-out or mask image
    /// from disk. The configured capture orientation is applied to the photo only.
    pub fn analyze_files(&self, image_path: &Path, mask_path: &Path) -> Result<Analysis> {
        let raw = self.file_capture(image_path).capture()?;
        let mask = PrecomputedMask::from_path(mask_path)
            .and_then(|p| p.segment(&raw))
            .map_err(CalibrationError::from)?;
        self.analyze(&raw, &mask)
    }

    /// Full orchestrated run with artifacts and a PA decision.
    pub fn calibrate(
        &self,
        capture: &dyn CaptureSource,
        segmenter: &dyn SegmentationProvider,
    ) -> CalibrationOutcome {
        self.orchestrator.run(capture, segmenter)
    }

    /// Full run with a caller-chosen run id.
    pub fn calibrate_with_run_id(
        &self,
        capture: &dyn CaptureSource,
        segmenter: &dyn SegmentationProvider,
        run_id: &str,
    ) -> CalibrationOutcome {
        self.orchestrator.run_with_id(capture, segmenter, Some(run_id))
    }

    /// A [`FileCapture`] configured with this calibrator's camera settings.
    pub fn file_capture(&self, path: &Path) -> FileCapture {
        let cfg = self.config();
        FileCapture::new(path, cfg.camera.placement).with_orientation(cfg.capture.orientation)
    }
}
