//! Orchestrated run: capture → mask → rectify → extract → score → select.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use super::result::{Analysis, CalibrationOutcome, PaDecision, StageTiming};
use super::state::{RunState, StateMachine};
use crate::artifacts::{
    ArtifactStore, RunArtifacts, MASK_FILE, RAW_IMAGE_FILE, RECTIFIED_IMAGE_FILE,
    RECTIFIED_MASK_FILE,
};
use crate::capture::{unix_ms, CaptureSource, RawImage};
use crate::config::CalibrationConfig;
use crate::error::{CalibrationError, Result};
use crate::extract::LineExtractor;
use crate::mask::{coverage, ForegroundMask};
use crate::pattern::PatternModel;
use crate::rectify::GeometricRectifier;
use crate::report::{FailureReport, LineSummary, RunReport, SegmentationReport, SelectionSummary};
use crate::score::SmoothnessScorer;
use crate::segmentation::{SegmentationError, SegmentationProvider};
use crate::select::{SelectionResult, ValueSelector};

/// Sequences one calibration run and owns its stage components.
///
/// Build once from a validated [`CalibrationConfig`]; each call to
/// [`run`](Self::run) is independent of the previous ones.
#[derive(Debug, Clone)]
pub struct CalibrationOrchestrator {
    config: CalibrationConfig,
    pattern: PatternModel,
    rectifier: GeometricRectifier,
    extractor: LineExtractor,
    scorer: SmoothnessScorer,
    selector: ValueSelector,
    store: Option<ArtifactStore>,
}

impl CalibrationOrchestrator {
    pub fn new(config: CalibrationConfig) -> Result<Self> {
        config.validate()?;
        let pattern = config.pattern_model()?;
        Ok(Self {
            pattern,
            rectifier: GeometricRectifier::new(config.rectify.clone(), config.camera.lens),
            extractor: LineExtractor::new(config.extract),
            scorer: SmoothnessScorer::new(config.score),
            selector: ValueSelector::new(config.select),
            store: config.run.artifacts_dir.clone().map(ArtifactStore::new),
            config,
        })
    }

    /// Persist artifacts under `store` instead of `run.artifacts_dir`.
    pub fn with_artifact_store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn pattern(&self) -> &PatternModel {
        &self.pattern
    }

    /// Image-analysis core on an already captured and segmented photo.
    pub fn analyze(&self, raw: &RawImage, mask: &ForegroundMask) -> Result<Analysis> {
        let rectified = self.rectifier.rectify(raw, mask, &self.pattern)?;
        let traces = self.extractor.extract(&rectified, &self.pattern);
        let scored = self.scorer.score_all(&traces);
        let selection = self.selector.select(&scored.scores, self.config.score.metric)?;
        Ok(Analysis {
            rectified,
            scored,
            selection,
        })
    }

    /// Full run with a run id derived from the capture timestamp.
    pub fn run(
        &self,
        capture: &dyn CaptureSource,
        segmenter: &dyn SegmentationProvider,
    ) -> CalibrationOutcome {
        self.run_with_id(capture, segmenter, None)
    }

    /// Full run. Never panics and never returns a PA value it could not validate:
    /// any failure yields [`PaDecision::RetainPrevious`].
    pub fn run_with_id(
        &self,
        capture: &dyn CaptureSource,
        segmenter: &dyn SegmentationProvider,
        run_id: Option<&str>,
    ) -> CalibrationOutcome {
        let mut run = Run::new(self, run_id);
        let result = run.execute(capture, segmenter);
        run.finish(result)
    }
}

/// Mutable bookkeeping of a single run.
struct Run<'a> {
    orch: &'a CalibrationOrchestrator,
    sm: StateMachine,
    started: Instant,
    stage_started: Instant,
    budget: Duration,
    explicit_id: bool,
    report: RunReport,
    artifacts: Option<RunArtifacts>,
    artifacts_attempted: bool,
}

impl<'a> Run<'a> {
    fn new(orch: &'a CalibrationOrchestrator, run_id: Option<&str>) -> Self {
        let now = Instant::now();
        let id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("run-{}", unix_ms(SystemTime::now())));
        Self {
            orch,
            sm: StateMachine::new(),
            started: now,
            stage_started: now,
            budget: orch.config.run.timeout(),
            explicit_id: run_id.is_some(),
            report: RunReport::new(id, &orch.pattern, &orch.config),
            artifacts: None,
            artifacts_attempted: false,
        }
    }

    fn execute(
        &mut self,
        capture: &dyn CaptureSource,
        segmenter: &dyn SegmentationProvider,
    ) -> Result<SelectionResult> {
        let orch = self.orch;

        let raw = capture.capture()?;
        let meta = raw.metadata().clone();
        if !self.explicit_id {
            self.report.run_id = format!("run-{}", meta.captured_at_unix_ms);
        }
        tracing::info!(
            "Run {}: captured {}x{} frame",
            self.report.run_id,
            meta.width,
            meta.height
        );
        self.report.capture = Some(meta);
        self.persist(|a| a.write_rgb(RAW_IMAGE_FILE, raw.pixels()));
        self.next_stage()?;

        let mask = self.acquire_mask(&raw, segmenter)?;
        self.persist(|a| a.write_gray(MASK_FILE, mask.as_image()));
        self.next_stage()?;

        let rectified = orch.rectifier.rectify(&raw, &mask, &orch.pattern)?;
        self.report.rectification = Some(rectified.info.clone());
        self.persist(|a| a.write_gray(RECTIFIED_IMAGE_FILE, &rectified.image));
        self.persist(|a| a.write_gray(RECTIFIED_MASK_FILE, &rectified.mask));
        self.next_stage()?;

        let traces = orch.extractor.extract(&rectified, &orch.pattern);
        self.next_stage()?;

        let scored = orch.scorer.score_all(&traces);
        self.report.lines = scored.scores.iter().map(LineSummary::from).collect();
        self.report.focus_windows = scored.focus_windows.clone();
        self.next_stage()?;

        let selection = orch
            .selector
            .select(&scored.scores, orch.config.score.metric)?;
        self.report.selection = Some(SelectionSummary::from(&selection));
        Ok(selection)
    }

    fn acquire_mask(
        &mut self,
        raw: &RawImage,
        segmenter: &dyn SegmentationProvider,
    ) -> Result<ForegroundMask> {
        let max_attempts = 1 + self.orch.config.segmentation.effective_retries();
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match segmenter.segment(raw) {
                Ok(mask) => break Ok(mask),
                Err(err) if attempts < max_attempts && self.remaining() > Duration::ZERO => {
                    tracing::warn!(
                        "Segmentation attempt {attempts}/{max_attempts} failed: {err}; retrying"
                    );
                }
                Err(err) => break Err(err),
            }
        };

        let mut seg_report = SegmentationReport {
            provider: segmenter.name().to_string(),
            attempts,
            mask_coverage: None,
        };
        let result = outcome.and_then(|mask| {
            let expected = raw.dimensions();
            if mask.dimensions() != expected {
                return Err(SegmentationError::DimensionMismatch {
                    expected,
                    got: mask.dimensions(),
                });
            }
            Ok(mask)
        });
        if let Ok(mask) = &result {
            let fraction = coverage(mask.as_image());
            tracing::debug!("Mask covers {:.1}% of the frame", 100.0 * fraction);
            seg_report.mask_coverage = Some(fraction);
        }
        self.report.segmentation = Some(seg_report);
        result.map_err(CalibrationError::from)
    }

    fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    fn check_deadline(&self) -> Result<()> {
        let elapsed = self.started.elapsed();
        if elapsed > self.budget {
            return Err(CalibrationError::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
                budget_ms: self.budget.as_millis() as u64,
            });
        }
        Ok(())
    }

    fn close_stage(&mut self) {
        let now = Instant::now();
        self.report.timings.push(StageTiming {
            stage: self.sm.state(),
            elapsed_ms: ms(now - self.stage_started),
        });
        self.stage_started = now;
    }

    fn next_stage(&mut self) -> Result<()> {
        self.close_stage();
        self.check_deadline()?;
        if let Err(err) = self.sm.advance() {
            tracing::error!("{err}");
        }
        Ok(())
    }

    fn artifacts(&mut self) -> Option<&RunArtifacts> {
        if !self.artifacts_attempted {
            self.artifacts_attempted = true;
            if let Some(store) = &self.orch.store {
                match store.create_run(&self.report.run_id) {
                    Ok(run) => self.artifacts = Some(run),
                    Err(err) => tracing::warn!(
                        "Artifacts disabled for this run under {}: {err}",
                        store.root().display()
                    ),
                }
            }
        }
        self.artifacts.as_ref()
    }

    fn persist(&mut self, write: impl FnOnce(&RunArtifacts) -> Result<PathBuf>) {
        if let Some(artifacts) = self.artifacts() {
            if let Err(err) = write(artifacts) {
                tracing::warn!("Failed to write artifact: {err}");
            }
        }
    }

    fn finish(mut self, result: Result<SelectionResult>) -> CalibrationOutcome {
        self.close_stage();
        let (decision, error) = match result {
            Ok(selection) => {
                if let Err(err) = self.sm.advance() {
                    tracing::error!("{err}");
                }
                tracing::info!(
                    "Run {} completed: line {} (pa={:.4})",
                    self.report.run_id,
                    selection.index + 1,
                    selection.pa_value
                );
                (
                    PaDecision::Apply {
                        pa_value: selection.pa_value,
                        line_index: selection.index,
                    },
                    None,
                )
            }
            Err(err) => {
                if let Err(e) = self.sm.fail(err.kind()) {
                    tracing::error!("{e}");
                }
                tracing::warn!(
                    "Run {} failed: {err}; retaining previous PA",
                    self.report.run_id
                );
                self.report.failure = Some(FailureReport::from(&err));
                (PaDecision::RetainPrevious { reason: err.kind() }, Some(err))
            }
        };

        self.report.state = self.sm.state();
        self.report.decision = decision;
        self.report.total_ms = ms(self.started.elapsed());

        let report = self.report.clone();
        self.persist(|a| a.write_report(&report));
        let artifacts_dir = self.artifacts.as_ref().map(|a| a.dir().to_path_buf());

        CalibrationOutcome {
            decision,
            report: self.report,
            error,
            artifacts_dir,
        }
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1e3
}
