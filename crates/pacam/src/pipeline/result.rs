use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::RunState;
use crate::error::{CalibrationError, ErrorKind};
use crate::rectify::RectifiedImage;
use crate::report::RunReport;
use crate::score::ScoredLines;
use crate::select::SelectionResult;

/// What the caller should do with the printer's PA setting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PaDecision {
    /// Apply the validated value.
    Apply { pa_value: f64, line_index: usize },
    /// Keep the current setting; the run did not produce a trustworthy value.
    RetainPrevious { reason: ErrorKind },
}

impl PaDecision {
    pub fn pa_value(&self) -> Option<f64> {
        match self {
            Self::Apply { pa_value, .. } => Some(*pa_value),
            Self::RetainPrevious { .. } => None,
        }
    }
}

/// Wall-clock time spent in one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: RunState,
    pub elapsed_ms: f64,
}

/// Products of the image-analysis core for one photo.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub rectified: RectifiedImage,
    pub scored: ScoredLines,
    pub selection: SelectionResult,
}

/// Result of a full orchestrated run.
#[derive(Debug)]
pub struct CalibrationOutcome {
    pub decision: PaDecision,
    pub report: RunReport,
    /// Set when the run failed.
    pub error: Option<CalibrationError>,
    /// Directory holding this run's artifacts, when persistence succeeded.
    pub artifacts_dir: Option<PathBuf>,
}

impl CalibrationOutcome {
    pub fn state(&self) -> RunState {
        self.report.state
    }

    pub fn run_id(&self) -> &str {
        &self.report.run_id
    }

    pub fn is_completed(&self) -> bool {
        self.report.state == RunState::Completed
    }

    /// Chosen PA value, only when the run completed.
    pub fn pa_value(&self) -> Option<f64> {
        self.decision.pa_value()
    }
}
