//! Per-run artifact directories.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<run_id>/raw.png
//!                 mask.png
//!                 rectified.png
//!                 rectified_mask.png
//!                 report.json
//! ```
//!
//! Directories are never reused: an existing `<run_id>` gets a `-1`, `-2`, ... suffix.

use std::path::{Path, PathBuf};

use image::{GrayImage, ImageFormat, RgbImage};

use crate::error::{CalibrationError, Result};
use crate::report::RunReport;

pub const RAW_IMAGE_FILE: &str = "raw.png";
pub const MASK_FILE: &str = "mask.png";
pub const RECTIFIED_IMAGE_FILE: &str = "rectified.png";
pub const RECTIFIED_MASK_FILE: &str = "rectified_mask.png";
pub const REPORT_FILE: &str = "report.json";

const MAX_SUFFIX: u32 = 10_000;

/// Root directory holding one subdirectory per run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh directory for `run_id`.
    pub fn create_run(&self, run_id: &str) -> Result<RunArtifacts> {
        validate_run_id(run_id)?;
        std::fs::create_dir_all(&self.root).map_err(|e| {
            CalibrationError::Artifact(format!("create {}: {e}", self.root.display()))
        })?;

        for suffix in 0..MAX_SUFFIX {
            let name = if suffix == 0 {
                run_id.to_string()
            } else {
                format!("{run_id}-{suffix}")
            };
            let dir = self.root.join(&name);
            match std::fs::create_dir(&dir) {
                Ok(()) => {
                    tracing::debug!("Created artifact directory {}", dir.display());
                    return Ok(RunArtifacts { dir });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(CalibrationError::Artifact(format!(
                        "create {}: {e}",
                        dir.display()
                    )))
                }
            }
        }
        Err(CalibrationError::Artifact(format!(
            "no free directory name for run '{run_id}' under {}",
            self.root.display()
        )))
    }
}

fn validate_run_id(run_id: &str) -> Result<()> {
    let ok = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(CalibrationError::Artifact(format!(
            "run id '{run_id}' must be non-empty ASCII letters, digits, '-', '_' or '.'"
        )))
    }
}

/// Writer for one run's directory.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_rgb(&self, name: &str, img: &RgbImage) -> Result<PathBuf> {
        let path = self.dir.join(name);
        img.save_with_format(&path, ImageFormat::Png)?;
        Ok(path)
    }

    pub fn write_gray(&self, name: &str, img: &GrayImage) -> Result<PathBuf> {
        let path = self.dir.join(name);
        img.save_with_format(&path, ImageFormat::Png)?;
        Ok(path)
    }

    pub fn write_report(&self, report: &RunReport) -> Result<PathBuf> {
        let path = self.dir.join(REPORT_FILE);
        report.write_json(&path)?;
        Ok(path)
    }
}
