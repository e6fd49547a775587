//! Calibration configuration.
//!
//! One JSON document (`pacam.config.v1`) carries every tunable of a run. Sections are
//! optional and fall back to their defaults; unknown top-level fields are rejected.
//!
//! ```json
//! {
//!   "schema": "pacam.config.v1",
//!   "pattern": { "pa_start": 0.0, "pa_end": 0.1, "pa_step": 0.005 },
//!   "camera": { "camera_offset_x": -40.0, "camera_offset_y": 20.0, "photo_height": 50.0 },
//!   "segmentation": { "endpoint": "https://example.invalid/segment", "timeout_s": 60 },
//!   "run": { "timeout_s": 300 }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::error::{CalibrationError, Result};
use crate::extract::ExtractConfig;
use crate::pattern::{CameraPlacement, PatternConfig, PatternModel};
use crate::pixelmap::LensDistortion;
use crate::rectify::RectifyConfig;
use crate::score::ScoreConfig;
use crate::segmentation::SegmentationConfig;
use crate::select::SelectConfig;

pub const CONFIG_SCHEMA_V1: &str = "pacam.config.v1";

/// Camera mounting and optics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    #[serde(flatten)]
    pub placement: CameraPlacement,
    /// Lens correction applied during rectification.
    pub lens: LensDistortion,
}

/// Outer run limits and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Deadline for the whole run in seconds, checked between stages.
    #[serde(alias = "timeout")]
    pub timeout_s: f64,
    /// Root for per-run artifact directories. `None` disables persistence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_s: 600.0,
            artifacts_dir: None,
        }
    }
}

impl RunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s.max(0.0))
    }
}

/// Complete configuration of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationConfig {
    pub schema: String,
    pub pattern: PatternConfig,
    pub camera: CameraConfig,
    pub rectify: RectifyConfig,
    pub extract: ExtractConfig,
    pub score: ScoreConfig,
    pub select: SelectConfig,
    pub segmentation: SegmentationConfig,
    pub capture: CaptureConfig,
    pub run: RunConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            schema: CONFIG_SCHEMA_V1.to_string(),
            pattern: PatternConfig::default(),
            camera: CameraConfig::default(),
            rectify: RectifyConfig::default(),
            extract: ExtractConfig::default(),
            score: ScoreConfig::default(),
            select: SelectConfig::default(),
            segmentation: SegmentationConfig::default(),
            capture: CaptureConfig::default(),
            run: RunConfig::default(),
        }
    }
}

impl CalibrationConfig {
    /// Load and validate a configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            CalibrationError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| CalibrationError::Configuration(format!("invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section; returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.schema != CONFIG_SCHEMA_V1 {
            return Err(CalibrationError::Configuration(format!(
                "unsupported config schema '{}' (expected '{}')",
                self.schema, CONFIG_SCHEMA_V1
            )));
        }
        PatternModel::new(&self.pattern)?;
        let checks = [
            self.camera.lens.validate(),
            self.rectify.validate(),
            self.extract.validate(),
            self.score.validate(),
            self.select.validate(),
            self.segmentation.validate(),
            self.validate_run(),
        ];
        checks
            .into_iter()
            .collect::<std::result::Result<Vec<()>, String>>()
            .map(|_| ())
            .map_err(CalibrationError::Configuration)
    }

    /// Validated pattern geometry.
    pub fn pattern_model(&self) -> Result<PatternModel> {
        PatternModel::new(&self.pattern)
    }

    fn validate_run(&self) -> std::result::Result<(), String> {
        if !self.run.timeout_s.is_finite() || self.run.timeout_s <= 0.0 {
            return Err("run.timeout_s must be > 0".to_string());
        }
        if !self.capture.snapshot_timeout_s.is_finite() || self.capture.snapshot_timeout_s <= 0.0 {
            return Err("capture.snapshot_timeout_s must be > 0".to_string());
        }
        Ok(())
    }
}
