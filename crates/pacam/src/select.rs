//! Best-line selection.

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};
use crate::score::{SelectionMetric, SmoothnessScore};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectConfig {
    /// Scores within this of the minimum count as tied; the lower index wins.
    pub tie_tolerance: f64,
    /// Fewer valid lines than this aborts the selection.
    pub min_valid_lines: usize,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            tie_tolerance: 1e-9,
            min_valid_lines: 1,
        }
    }
}

impl SelectConfig {
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if !self.tie_tolerance.is_finite() || self.tie_tolerance < 0.0 {
            return Err("select.tie_tolerance must be >= 0".to_string());
        }
        if self.min_valid_lines == 0 {
            return Err("select.min_valid_lines must be >= 1".to_string());
        }
        Ok(())
    }
}

/// One entry of the ranking, best first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedScore {
    pub index: usize,
    pub pa_value: f64,
    /// Ranked value; `None` for invalid lines.
    pub value: Option<f64>,
}

/// Chosen line and how clearly it won.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub index: usize,
    pub pa_value: f64,
    pub score: f64,
    /// Runner-up value minus the winner's; `None` with a single valid line.
    pub margin: Option<f64>,
    pub metric: SelectionMetric,
    pub valid_lines: usize,
    pub ranking: Vec<RankedScore>,
}

#[derive(Debug, Clone, Default)]
pub struct ValueSelector {
    config: SelectConfig,
}

impl ValueSelector {
    pub fn new(config: SelectConfig) -> Self {
        Self { config }
    }

    /// Pick the lowest-scoring valid line.
    ///
    /// Every valid line within `tie_tolerance` of the minimum counts as tied and the
    /// lowest index among them wins. At least one valid line must come from a
    /// complete trace; a set of partial traces alone is not trusted.
    pub fn select(
        &self,
        scores: &[SmoothnessScore],
        metric: SelectionMetric,
    ) -> Result<SelectionResult> {
        let tol = self.config.tie_tolerance;
        let mut ordered: Vec<&SmoothnessScore> = scores.iter().collect();
        ordered.sort_by_key(|s| s.index);

        let valid: Vec<(&SmoothnessScore, f64)> = ordered
            .iter()
            .filter(|s| s.valid)
            .map(|s| (*s, s.metric_value(metric)))
            .filter(|(_, v)| v.is_finite())
            .collect();

        if valid.len() < self.config.min_valid_lines || valid.is_empty() {
            return Err(CalibrationError::NoValidLine {
                valid: valid.len(),
                total: scores.len(),
                required: self.config.min_valid_lines,
            });
        }
        if valid.iter().all(|(s, _)| s.trace.incomplete) {
            tracing::warn!(
                "All {} valid lines come from incomplete traces; refusing to select",
                valid.len()
            );
            return Err(CalibrationError::NoValidLine {
                valid: 0,
                total: scores.len(),
                required: self.config.min_valid_lines,
            });
        }

        let min_value = valid.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
        let best = valid
            .iter()
            .position(|(_, v)| *v <= min_value + tol)
            .unwrap_or(0);
        let (winner, best_value) = valid[best];

        let mut ranked_valid: Vec<(usize, f64, f64)> = valid
            .iter()
            .map(|(s, v)| (s.index, s.pa_value, *v))
            .collect();
        // Winner first even when a later line is lower by less than the tolerance.
        ranked_valid.sort_by(|a, b| a.2.total_cmp(&b.2).then(a.0.cmp(&b.0)));
        if let Some(pos) = ranked_valid.iter().position(|r| r.0 == winner.index) {
            let w = ranked_valid.remove(pos);
            ranked_valid.insert(0, w);
        }

        let margin = ranked_valid.get(1).map(|r| r.2 - best_value);

        let ranking: Vec<RankedScore> = ranked_valid
            .iter()
            .map(|&(index, pa_value, value)| RankedScore {
                index,
                pa_value,
                value: Some(value),
            })
            .chain(
                ordered
                    .iter()
                    .filter(|s| !s.valid || !s.metric_value(metric).is_finite())
                    .map(|s| RankedScore {
                        index: s.index,
                        pa_value: s.pa_value,
                        value: None,
                    }),
            )
            .collect();

        tracing::info!(
            "Selected line {} (pa={:.4}, score={:.4}, margin={})",
            winner.index,
            winner.pa_value,
            best_value,
            margin.map_or_else(|| "n/a".to_string(), |m| format!("{m:.4}"))
        );

        Ok(SelectionResult {
            index: winner.index,
            pa_value: winner.pa_value,
            score: best_value,
            margin,
            metric,
            valid_lines: valid.len(),
            ranking,
        })
    }
}
