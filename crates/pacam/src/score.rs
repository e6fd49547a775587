//! Line smoothness scoring.
//!
//! A well-tuned PA value prints a line of constant width along a straight path. The
//! score of a trace is
//!
//! ```text
//! score = rms(x - poly_fit(row)) + width_weight * std(width) + coverage_penalty
//! ```
//!
//! where `poly_fit` is a least-squares polynomial of `degree` in the row coordinate, so
//! global offset and slight tilt or bow do not count. Lower is smoother.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::extract::LineTrace;

/// What to do with traces flagged `incomplete`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum IncompletePolicy {
    /// Add `per_missing_fraction * (1 - coverage)` to every trace's score.
    Penalize { per_missing_fraction: f64 },
    /// Mark incomplete traces invalid.
    Invalidate,
}

impl Default for IncompletePolicy {
    fn default() -> Self {
        Self::Penalize {
            per_missing_fraction: 50.0,
        }
    }
}

/// Which score the selector ranks by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMetric {
    /// Whole-trace score.
    #[default]
    Overall,
    /// Score restricted to the focus windows.
    Focus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    /// Degree of the reference polynomial.
    pub poly_degree: usize,
    /// Weight of the cross-section width standard deviation (px per px).
    pub width_weight: f64,
    pub incomplete: IncompletePolicy,
    /// Half-height of each focus window as a fraction of the traced row span.
    pub focus_window_frac: f64,
    pub metric: SelectionMetric,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            poly_degree: 2,
            width_weight: 0.5,
            incomplete: IncompletePolicy::default(),
            focus_window_frac: 0.1,
            metric: SelectionMetric::Overall,
        }
    }
}

impl ScoreConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.poly_degree > 6 {
            return Err("score.poly_degree must be <= 6".to_string());
        }
        if !self.width_weight.is_finite() || self.width_weight < 0.0 {
            return Err("score.width_weight must be >= 0".to_string());
        }
        if let IncompletePolicy::Penalize {
            per_missing_fraction,
        } = self.incomplete
        {
            if !per_missing_fraction.is_finite() || per_missing_fraction < 0.0 {
                return Err("score.incomplete.per_missing_fraction must be >= 0".to_string());
            }
        }
        if !(0.0..=0.5).contains(&self.focus_window_frac) {
            return Err("score.focus_window_frac must be in [0, 0.5]".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// No scan line produced a point.
    NoCoverage,
    /// Fewer points than the polynomial needs.
    TooFewPoints,
    /// Trace was incomplete and the policy invalidates those.
    Incomplete,
    /// Least-squares solve failed.
    FitFailed,
}

/// Inclusive row range used for the focus score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowWindow {
    pub start: u32,
    pub end: u32,
}

impl RowWindow {
    fn contains(&self, row: u32) -> bool {
        row >= self.start && row <= self.end
    }
}

/// Irregularity of one line. Lower is smoother.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothnessScore {
    pub index: usize,
    pub pa_value: f64,
    /// Combined score; `f64::INFINITY` when invalid.
    pub score: f64,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<InvalidReason>,
    pub residual_rms: f64,
    pub width_std: f64,
    pub coverage_penalty: f64,
    /// Score over the focus windows only, when computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_score: Option<f64>,
    pub trace: LineTrace,
    /// Fit residual per trace point.
    #[serde(skip)]
    residuals: Vec<f64>,
}

impl SmoothnessScore {
    /// Value the selector ranks by under `metric`.
    pub fn metric_value(&self, metric: SelectionMetric) -> f64 {
        if !self.valid {
            return f64::INFINITY;
        }
        match metric {
            SelectionMetric::Overall => self.score,
            SelectionMetric::Focus => self.focus_score.unwrap_or(self.score),
        }
    }

    fn invalid(trace: &LineTrace, reason: InvalidReason) -> Self {
        Self {
            index: trace.index,
            pa_value: trace.pa_value,
            score: f64::INFINITY,
            valid: false,
            invalid_reason: Some(reason),
            residual_rms: f64::NAN,
            width_std: f64::NAN,
            coverage_penalty: 0.0,
            focus_score: None,
            trace: trace.clone(),
            residuals: Vec::new(),
        }
    }
}

/// All scores of a run plus the focus windows they were evaluated on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredLines {
    pub scores: Vec<SmoothnessScore>,
    pub focus_windows: Vec<RowWindow>,
}

#[derive(Debug, Clone, Default)]
pub struct SmoothnessScorer {
    config: ScoreConfig,
}

impl SmoothnessScorer {
    pub fn new(config: ScoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    /// Score a single trace in isolation (no focus score).
    pub fn score(&self, trace: &LineTrace) -> SmoothnessScore {
        let cfg = &self.config;
        if trace.points.is_empty() {
            return SmoothnessScore::invalid(trace, InvalidReason::NoCoverage);
        }
        if trace.incomplete && cfg.incomplete == IncompletePolicy::Invalidate {
            return SmoothnessScore::invalid(trace, InvalidReason::Incomplete);
        }
        if trace.points.len() < cfg.poly_degree + 2 {
            return SmoothnessScore::invalid(trace, InvalidReason::TooFewPoints);
        }

        let rows: Vec<f64> = trace.points.iter().map(|p| p.row as f64).collect();
        let xs: Vec<f64> = trace.points.iter().map(|p| p.x).collect();
        let Some(fitted) = polyfit_eval(&rows, &xs, cfg.poly_degree) else {
            return SmoothnessScore::invalid(trace, InvalidReason::FitFailed);
        };
        let residuals: Vec<f64> = xs.iter().zip(&fitted).map(|(x, f)| x - f).collect();

        let residual_rms = rms(&residuals);
        let widths: Vec<f64> = trace.points.iter().map(|p| p.width).collect();
        let width_std = std_dev(&widths);
        let coverage_penalty = self.penalty(1.0 - trace.coverage());

        SmoothnessScore {
            index: trace.index,
            pa_value: trace.pa_value,
            score: residual_rms + cfg.width_weight * width_std + coverage_penalty,
            valid: true,
            invalid_reason: None,
            residual_rms,
            width_std,
            coverage_penalty,
            focus_score: None,
            trace: trace.clone(),
            residuals,
        }
    }

    /// Score every trace, then derive focus windows from the width variation across
    /// lines and attach each valid line's focus score.
    pub fn score_all(&self, traces: &[LineTrace]) -> ScoredLines {
        let mut scores: Vec<SmoothnessScore> = traces.iter().map(|t| self.score(t)).collect();
        let focus_windows = focus_windows(&scores, self.config.focus_window_frac);

        if !focus_windows.is_empty() {
            for s in scores.iter_mut().filter(|s| s.valid) {
                s.focus_score = Some(self.windowed_score(s, &focus_windows));
            }
        }

        for s in &scores {
            if s.valid {
                tracing::debug!(
                    "line {:>2} pa={:.4} score={:.4} (rms={:.3} wstd={:.3} pen={:.3})",
                    s.index,
                    s.pa_value,
                    s.score,
                    s.residual_rms,
                    s.width_std,
                    s.coverage_penalty
                );
            } else {
                tracing::debug!("line {:>2} invalid: {:?}", s.index, s.invalid_reason);
            }
        }

        ScoredLines {
            scores,
            focus_windows,
        }
    }

    fn penalty(&self, missing_fraction: f64) -> f64 {
        match self.config.incomplete {
            IncompletePolicy::Penalize {
                per_missing_fraction,
            } => per_missing_fraction * missing_fraction.clamp(0.0, 1.0),
            IncompletePolicy::Invalidate => 0.0,
        }
    }

    fn windowed_score(&self, s: &SmoothnessScore, windows: &[RowWindow]) -> f64 {
        let inside: Vec<usize> = s
            .trace
            .points
            .iter()
            .enumerate()
            .filter(|(_, p)| windows.iter().any(|w| w.contains(p.row)))
            .map(|(k, _)| k)
            .collect();
        let window_rows: usize = windows
            .iter()
            .map(|w| (w.end - w.start + 1) as usize)
            .sum();
        let missing = if window_rows == 0 {
            0.0
        } else {
            1.0 - inside.len() as f64 / window_rows as f64
        };
        if inside.is_empty() {
            return match self.config.incomplete {
                IncompletePolicy::Invalidate => f64::INFINITY,
                IncompletePolicy::Penalize { .. } => self.penalty(1.0),
            };
        }
        let residuals: Vec<f64> = inside.iter().map(|&k| s.residuals[k]).collect();
        let widths: Vec<f64> = inside.iter().map(|&k| s.trace.points[k].width).collect();
        rms(&residuals) + self.config.width_weight * std_dev(&widths) + self.penalty(missing)
    }
}

/// Rows where cross-section width varies most between lines: the peak of each half of
/// the traced span, widened by `frac` of the span on both sides.
fn focus_windows(scores: &[SmoothnessScore], frac: f64) -> Vec<RowWindow> {
    let valid: Vec<&SmoothnessScore> = scores.iter().filter(|s| s.valid).collect();
    let Some(r_min) = valid
        .iter()
        .flat_map(|s| s.trace.points.iter().map(|p| p.row))
        .min()
    else {
        return Vec::new();
    };
    let r_max = valid
        .iter()
        .flat_map(|s| s.trace.points.iter().map(|p| p.row))
        .max()
        .unwrap_or(r_min);
    let span = (r_max - r_min + 1) as usize;

    let mut widths = vec![vec![0.0; valid.len()]; span];
    for (j, s) in valid.iter().enumerate() {
        for p in &s.trace.points {
            widths[(p.row - r_min) as usize][j] = p.width;
        }
    }
    let spread: Vec<f64> = widths.iter().map(|row| std_dev(row)).collect();

    let half_width = (frac * span as f64).round() as u32;
    let mid = span / 2;
    [(0, mid), (mid, span)]
        .into_iter()
        .filter(|(a, b)| b > a)
        .map(|(a, b)| {
            let peak = (a..b).fold(a, |best, k| if spread[k] > spread[best] { k } else { best });
            let peak_row = r_min + peak as u32;
            RowWindow {
                start: peak_row.saturating_sub(half_width).max(r_min),
                end: (peak_row + half_width).min(r_max),
            }
        })
        .collect()
}

/// Least-squares polynomial of `degree` through `(t, y)`, evaluated at every `t`.
///
/// `t` is mapped to [-1, 1] first to keep the Vandermonde matrix well conditioned.
fn polyfit_eval(t: &[f64], y: &[f64], degree: usize) -> Option<Vec<f64>> {
    let n = t.len();
    let (lo, hi) = t
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let mid = 0.5 * (lo + hi);
    let half = (0.5 * (hi - lo)).max(1.0);
    let u: Vec<f64> = t.iter().map(|v| (v - mid) / half).collect();

    let cols = degree + 1;
    let a = DMatrix::from_fn(n, cols, |i, j| u[i].powi(j as i32));
    let b = DVector::from_column_slice(y);
    let coeffs = a.clone().svd(true, true).solve(&b, 1e-12).ok()?;
    let fitted = a * coeffs;
    fitted
        .iter()
        .all(|v| v.is_finite())
        .then(|| fitted.iter().copied().collect())
}

fn rms(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    (v.iter().map(|r| r * r).sum::<f64>() / v.len() as f64).sqrt()
}

fn std_dev(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let n = v.len() as f64;
    let mean = v.iter().sum::<f64>() / n;
    (v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{LineExtractor, TracePoint};
    use crate::pattern::{PatternConfig, PatternModel};
    use crate::rectify::RectifiedImage;
    use crate::test_utils::{render_canonical, LineStyle, SyntheticPattern};
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};

    fn trace(index: usize, points: Vec<TracePoint>, rows_scanned: usize) -> LineTrace {
        LineTrace {
            index,
            pa_value: index as f64 * 0.005,
            incomplete: points.is_empty() || points.len() * 10 < rows_scanned * 6,
            points,
            rows_scanned,
        }
    }

    fn tilted_points(n: u32, slope: f64, offset: f64) -> Vec<TracePoint> {
        (0..n)
            .map(|r| TracePoint {
                row: r,
                x: offset + slope * r as f64,
                width: 6.0,
            })
            .collect()
    }

    #[test]
    fn tilt_and_offset_do_not_count() {
        let scorer = SmoothnessScorer::default();
        let s = scorer.score(&trace(0, tilted_points(200, 0.05, 321.0), 200));
        assert!(s.valid);
        assert_abs_diff_eq!(s.score, 0.0, epsilon = 1e-8);

        let bowed: Vec<TracePoint> = (0..200u32)
            .map(|r| {
                let t = r as f64 - 100.0;
                TracePoint {
                    row: r,
                    x: 50.0 + 1e-4 * t * t,
                    width: 6.0,
                }
            })
            .collect();
        let s = scorer.score(&trace(0, bowed, 200));
        assert_abs_diff_eq!(s.residual_rms, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn jitter_and_blobs_raise_the_score() {
        let scorer = SmoothnessScorer::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let jittery: Vec<TracePoint> = (0..200u32)
            .map(|r| TracePoint {
                row: r,
                x: 80.0 + rng.gen_range(-1.5..1.5),
                width: 6.0,
            })
            .collect();
        let blobby: Vec<TracePoint> = (0..200u32)
            .map(|r| TracePoint {
                row: r,
                x: 80.0,
                width: if (60..80).contains(&r) { 11.0 } else { 6.0 },
            })
            .collect();
        let j = scorer.score(&trace(1, jittery, 200));
        let b = scorer.score(&trace(2, blobby, 200));
        assert!(j.residual_rms > 0.5);
        assert_abs_diff_eq!(b.residual_rms, 0.0, epsilon = 1e-8);
        assert!(b.width_std > 1.0);
        assert!(b.score > 0.5);
    }

    #[test]
    fn incomplete_policy_is_applied() {
        let sparse = trace(4, tilted_points(100, 0.0, 10.0), 200);
        assert!(sparse.incomplete);

        let penalize = SmoothnessScorer::default().score(&sparse);
        assert!(penalize.valid);
        assert_abs_diff_eq!(penalize.coverage_penalty, 25.0, epsilon = 1e-12);
        assert_abs_diff_eq!(penalize.score, 25.0, epsilon = 1e-8);

        let invalidate = SmoothnessScorer::new(ScoreConfig {
            incomplete: IncompletePolicy::Invalidate,
            ..ScoreConfig::default()
        })
        .score(&sparse);
        assert!(!invalidate.valid);
        assert_eq!(invalidate.invalid_reason, Some(InvalidReason::Incomplete));
        assert_eq!(invalidate.score, f64::INFINITY);
    }

    #[test]
    fn empty_and_tiny_traces_are_invalid() {
        let scorer = SmoothnessScorer::default();
        let empty = scorer.score(&trace(0, Vec::new(), 300));
        assert!(!empty.valid);
        assert_eq!(empty.invalid_reason, Some(InvalidReason::NoCoverage));

        let mut t = trace(1, tilted_points(3, 0.0, 5.0), 3);
        t.incomplete = false;
        let tiny = scorer.score(&t);
        assert_eq!(tiny.invalid_reason, Some(InvalidReason::TooFewPoints));
    }

    #[test]
    fn straight_line_beats_sinusoidal_neighbours() {
        let model = PatternModel::new(&PatternConfig::default()).unwrap();
        let synth = SyntheticPattern::new(model, 10.0, |i| {
            if i == 9 {
                LineStyle::Straight
            } else {
                LineStyle::Sinusoidal {
                    amplitude_px: 2.5,
                    period_px: 48.0 + i as f64,
                }
            }
        });
        let (gray, mask) = render_canonical(&synth);
        let rect = RectifiedImage::from_canonical(gray, mask, 10.0);
        let traces = LineExtractor::default().extract(&rect, &model);
        let scored = SmoothnessScorer::default().score_all(&traces);

        assert_eq!(scored.scores.len(), 21);
        for s in &scored.scores {
            assert!(s.valid);
            if s.index == 9 {
                assert_abs_diff_eq!(s.score, 0.0, epsilon = 1e-6);
            } else {
                assert!(s.score > 0.5, "line {} scored {}", s.index, s.score);
            }
        }
        assert_eq!(scored.focus_windows.len(), 2);
        let straight = &scored.scores[9];
        assert_abs_diff_eq!(straight.focus_score.unwrap(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn focus_windows_find_the_blobby_rows() {
        let scorer = SmoothnessScorer::default();
        let lines: Vec<LineTrace> = (0..5)
            .map(|i| {
                let pts = (0..200u32)
                    .map(|r| TracePoint {
                        row: r,
                        x: 30.0 * i as f64,
                        width: if i % 2 == 1 && (20..30).contains(&r) {
                            12.0
                        } else if i % 2 == 1 && (150..160).contains(&r) {
                            9.0
                        } else {
                            6.0
                        },
                    })
                    .collect();
                trace(i, pts, 200)
            })
            .collect();
        let scored = scorer.score_all(&lines);
        let w = &scored.focus_windows;
        assert_eq!(w.len(), 2);
        assert!(w[0].contains(20) && w[0].start == 0 && w[0].end == 40);
        assert!(w[1].contains(150) && w[1].start == 130 && w[1].end == 170);
        assert_abs_diff_eq!(scored.scores[0].focus_score.unwrap(), 0.0, epsilon = 1e-8);
        assert!(scored.scores[1].focus_score.unwrap() > scored.scores[1].score);
    }
}
