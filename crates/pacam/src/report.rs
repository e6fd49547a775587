//! Versioned run report (`pacam.report.v1`).
//!
//! Written as `report.json` next to the run's images on success and on failure. Reuses
//! pipeline structures where they serialize compactly; per-line summaries drop the raw
//! trace points.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureMetadata;
use crate::config::CalibrationConfig;
use crate::error::{CalibrationError, ErrorKind};
use crate::pattern::PatternModel;
use crate::pipeline::{PaDecision, RunState, StageTiming};
use crate::rectify::RectificationInfo;
use crate::score::{InvalidReason, RowWindow, SmoothnessScore};
use crate::select::SelectionResult;

pub const REPORT_SCHEMA_V1: &str = "pacam.report.v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: String,
    pub state: RunState,
    pub decision: PaDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    pub timings: Vec<StageTiming>,
    pub total_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<SegmentationReport>,
    pub pattern: PatternSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rectification: Option<RectificationInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub focus_windows: Vec<RowWindow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<LineSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionSummary>,
    pub config: CalibrationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&CalibrationError> for FailureReport {
    fn from(err: &CalibrationError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationReport {
    pub provider: String,
    pub attempts: u32,
    /// Fraction of the photo marked foreground.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_coverage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub line_count: usize,
    pub pa_start: f64,
    pub pa_end: f64,
    pub pa_step: f64,
    pub extent_mm: [f64; 2],
    /// Nozzle position that centres the camera over the pattern.
    pub photo_position: [f64; 3],
}

impl PatternSummary {
    pub fn new(model: &PatternModel, config: &CalibrationConfig) -> Self {
        Self {
            line_count: model.line_count,
            pa_start: model.pa_start,
            pa_end: model.pa_end,
            pa_step: model.pa_step,
            extent_mm: model.pattern_extent_mm(),
            photo_position: model.photo_position(&config.camera.placement),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSummary {
    pub index: usize,
    pub pa_value: f64,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<InvalidReason>,
    pub incomplete: bool,
    pub coverage: f64,
    pub points: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual_rms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_std: Option<f64>,
    pub coverage_penalty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_score: Option<f64>,
}

impl From<&SmoothnessScore> for LineSummary {
    fn from(s: &SmoothnessScore) -> Self {
        let if_valid = |v: f64| (s.valid && v.is_finite()).then_some(v);
        Self {
            index: s.index,
            pa_value: s.pa_value,
            valid: s.valid,
            invalid_reason: s.invalid_reason,
            incomplete: s.trace.incomplete,
            coverage: s.trace.coverage(),
            points: s.trace.points.len(),
            score: if_valid(s.score),
            residual_rms: if_valid(s.residual_rms),
            width_std: if_valid(s.width_std),
            coverage_penalty: s.coverage_penalty,
            focus_score: s.focus_score.filter(|v| v.is_finite()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSummary {
    /// 1-based line number as counted on the print.
    pub line_number: usize,
    #[serde(flatten)]
    pub result: SelectionResult,
}

impl From<&SelectionResult> for SelectionSummary {
    fn from(result: &SelectionResult) -> Self {
        Self {
            line_number: result.index + 1,
            result: result.clone(),
        }
    }
}

impl RunReport {
    /// Report for a run that has not progressed yet.
    pub fn new(run_id: impl Into<String>, model: &PatternModel, config: &CalibrationConfig) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_V1.to_string(),
            run_id: run_id.into(),
            state: RunState::AwaitingCapture,
            decision: PaDecision::RetainPrevious {
                reason: ErrorKind::Configuration,
            },
            failure: None,
            timings: Vec::new(),
            total_ms: 0.0,
            capture: None,
            segmentation: None,
            pattern: PatternSummary::new(model, config),
            rectification: None,
            focus_windows: Vec::new(),
            lines: Vec::new(),
            selection: None,
            config: config.clone(),
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> crate::error::Result<()> {
        let json = self.to_json_pretty()?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{LineTrace, TracePoint};
    use crate::score::SmoothnessScorer;

    fn report() -> RunReport {
        let cfg = CalibrationConfig::default();
        let model = cfg.pattern_model().unwrap();
        RunReport::new("run-42", &model, &cfg)
    }

    #[test]
    fn new_report_carries_schema_and_pattern() {
        let r = report();
        assert_eq!(r.schema_version, REPORT_SCHEMA_V1);
        assert_eq!(r.pattern.line_count, 21);
        assert_eq!(r.pattern.extent_mm, [72.0, 40.0]);
        let json: serde_json::Value = serde_json::from_str(&r.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["schema_version"], "pacam.report.v1");
        assert_eq!(json["run_id"], "run-42");
        assert!(json.get("selection").is_none());
        assert!(json.get("lines").is_none());
    }

    #[test]
    fn invalid_lines_have_no_score_fields() {
        let trace = LineTrace {
            index: 3,
            pa_value: 0.015,
            points: Vec::new(),
            rows_scanned: 100,
            incomplete: true,
        };
        let s = SmoothnessScorer::default().score(&trace);
        let line = LineSummary::from(&s);
        assert!(!line.valid);
        assert_eq!(line.score, None);
        assert_eq!(line.residual_rms, None);
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["invalid_reason"], "no_coverage");
        assert!(json.get("score").is_none());
    }

    #[test]
    fn failure_round_trips() {
        let mut r = report();
        let err = CalibrationError::PatternNotFound("no contour".to_string());
        r.state = RunState::Failed(err.kind());
        r.failure = Some(FailureReport::from(&err));
        r.decision = PaDecision::RetainPrevious { reason: err.kind() };
        let back: RunReport = serde_json::from_str(&r.to_json_pretty().unwrap()).unwrap();
        assert_eq!(back, r);
        assert_eq!(back.failure.unwrap().kind, ErrorKind::PatternNotFound);
    }

    #[test]
    fn valid_line_summary_keeps_components() {
        let trace = LineTrace {
            index: 0,
            pa_value: 0.0,
            points: (0..50u32)
                .map(|row| TracePoint {
                    row,
                    x: 10.0,
                    width: 4.0,
                })
                .collect(),
            rows_scanned: 50,
            incomplete: false,
        };
        let s = SmoothnessScorer::default().score(&trace);
        let line = LineSummary::from(&s);
        assert!(line.valid);
        assert_eq!(line.points, 50);
        assert!(line.score.unwrap().abs() < 1e-8);
    }
}
