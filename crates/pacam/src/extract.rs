//! Per-band centreline tracking in the rectified frame.
//!
//! Each printed line owns one vertical band (see [`PatternModel::band_bounds`]). On
//! every scan line inside the band the foreground run closest to the band centre is
//! taken as the line's cross-section; its centroid and width form one trace point.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::mask::{remove_small_components, FOREGROUND};
use crate::pattern::PatternModel;
use crate::rectify::RectifiedImage;

/// Line extraction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Rows this close to the top and bottom edges are skipped (outline border).
    pub edge_margin_mm: f64,
    /// Traces missing more than this fraction of scanned rows are `incomplete`.
    pub max_gap_fraction: f64,
    /// Runs shorter than this many pixels are ignored.
    pub min_run_px: u32,
    /// Foreground components smaller than this are removed before tracing.
    pub min_blob_area_px: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            edge_margin_mm: 2.0,
            max_gap_fraction: 0.4,
            min_run_px: 1,
            min_blob_area_px: 100,
        }
    }
}

impl ExtractConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.edge_margin_mm.is_finite() || self.edge_margin_mm < 0.0 {
            return Err("extract.edge_margin_mm must be >= 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.max_gap_fraction) {
            return Err("extract.max_gap_fraction must be in [0, 1]".to_string());
        }
        Ok(())
    }
}

/// One cross-section of a printed line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    /// Scan-line index in the rectified image.
    pub row: u32,
    /// Run centroid in continuous pixel coordinates.
    pub x: f64,
    /// Run length in pixels.
    pub width: f64,
}

/// Extracted centreline of one printed line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineTrace {
    pub index: usize,
    pub pa_value: f64,
    pub points: Vec<TracePoint>,
    /// Number of scan lines examined.
    pub rows_scanned: usize,
    /// Set when too many scan lines had no foreground in the band.
    pub incomplete: bool,
}

impl LineTrace {
    /// Fraction of scanned rows that produced a point.
    pub fn coverage(&self) -> f64 {
        if self.rows_scanned == 0 {
            0.0
        } else {
            self.points.len() as f64 / self.rows_scanned as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LineExtractor {
    config: ExtractConfig,
}

impl LineExtractor {
    pub fn new(config: ExtractConfig) -> Self {
        Self { config }
    }

    /// One trace per pattern index, in index order.
    pub fn extract(&self, rectified: &RectifiedImage, pattern: &PatternModel) -> Vec<LineTrace> {
        let cfg = &self.config;
        let mask = remove_small_components(&rectified.mask, cfg.min_blob_area_px);
        let (w, h) = mask.dimensions();

        let margin = (cfg.edge_margin_mm * rectified.px_per_mm).round() as u32;
        let rows = margin..h.saturating_sub(margin);

        let traces: Vec<LineTrace> = (0..pattern.line_count)
            .map(|index| {
                let band = pattern.band_bounds(index, w);
                let points: Vec<TracePoint> = rows
                    .clone()
                    .filter_map(|row| nearest_run(&mask, row, band, cfg.min_run_px))
                    .collect();
                let rows_scanned = rows.len();
                let gap_fraction = if rows_scanned == 0 {
                    1.0
                } else {
                    1.0 - points.len() as f64 / rows_scanned as f64
                };
                LineTrace {
                    index,
                    pa_value: pattern.index_to_pa(index),
                    incomplete: points.is_empty() || gap_fraction > cfg.max_gap_fraction,
                    points,
                    rows_scanned,
                }
            })
            .collect();

        let n_incomplete = traces.iter().filter(|t| t.incomplete).count();
        tracing::debug!(
            "Extracted {} traces over {} rows ({} incomplete)",
            traces.len(),
            rows.len(),
            n_incomplete
        );
        traces
    }
}

/// Foreground run in `row` within `band` whose centroid is closest to the band centre.
///
/// Runs are clipped to the band. Ties go to the left run.
fn nearest_run(mask: &GrayImage, row: u32, band: (f64, f64), min_run: u32) -> Option<TracePoint> {
    let w = mask.width();
    let lo = band.0.max(0.0).round() as u32;
    let hi = (band.1.round().max(0.0) as u32).min(w);
    if lo >= hi {
        return None;
    }
    let center = 0.5 * (band.0 + band.1);

    let mut best: Option<(f64, TracePoint)> = None;
    let mut x = lo;
    while x < hi {
        if mask.get_pixel(x, row)[0] != FOREGROUND {
            x += 1;
            continue;
        }
        let start = x;
        while x < hi && mask.get_pixel(x, row)[0] == FOREGROUND {
            x += 1;
        }
        let len = x - start;
        if len < min_run.max(1) {
            continue;
        }
        // Centroid of pixel centres start+0.5 .. x-0.5.
        let cx = 0.5 * (start + x) as f64;
        let dist = (cx - center).abs();
        if best.as_ref().map_or(true, |(d, _)| dist < *d) {
            best = Some((
                dist,
                TracePoint {
                    row,
                    x: cx,
                    width: len as f64,
                },
            ));
        }
    }
    best.map(|(_, p)| p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternConfig;
    use crate::test_utils::{render_canonical, LineStyle, SyntheticPattern};
    use approx::assert_abs_diff_eq;
    use image::Luma;

    fn model() -> PatternModel {
        PatternModel::new(&PatternConfig::default()).unwrap()
    }

    fn rectified(style: impl Fn(usize) -> LineStyle) -> RectifiedImage {
        let synth = SyntheticPattern::new(model(), 10.0, style);
        let (gray, mask) = render_canonical(&synth);
        RectifiedImage::from_canonical(gray, mask, 10.0)
    }

    #[test]
    fn straight_lines_trace_band_centres() {
        let m = model();
        let traces = LineExtractor::default().extract(&rectified(|_| LineStyle::Straight), &m);
        assert_eq!(traces.len(), 21);
        for t in &traces {
            assert!(!t.incomplete);
            assert_eq!(t.rows_scanned, 400 - 2 * 20);
            assert_abs_diff_eq!(t.coverage(), 1.0);
            let (x0, x1) = m.band_bounds(t.index, 720);
            for p in &t.points {
                assert_abs_diff_eq!(p.x, 0.5 * (x0 + x1), epsilon = 1e-9);
                assert_abs_diff_eq!(p.width, 6.0);
            }
            assert_abs_diff_eq!(t.pa_value, m.index_to_pa(t.index), epsilon = 1e-12);
        }
    }

    #[test]
    fn missing_lines_are_incomplete() {
        let m = model();
        let img = rectified(|i| match i {
            3 => LineStyle::Absent,
            4 => LineStyle::Partial {
                from: 0.0,
                to: 0.4,
            },
            5 => LineStyle::Partial {
                from: 0.1,
                to: 0.9,
            },
            _ => LineStyle::Straight,
        });
        let traces = LineExtractor::default().extract(&img, &m);
        assert!(traces[3].incomplete);
        assert!(traces[3].points.is_empty());
        assert_eq!(traces[3].coverage(), 0.0);
        assert!(traces[4].incomplete);
        assert!(!traces[5].incomplete);
        assert!(traces[5].coverage() < 1.0);
    }

    #[test]
    fn neighbour_bleed_is_ignored() {
        let m = model();
        let mut img = rectified(|_| LineStyle::Straight);
        // Blob from line 7 leaking into the right edge of band 6.
        let (_, x1) = m.band_bounds(6, 720);
        for y in 100..140 {
            for x in (x1 as u32 - 4)..(x1 as u32) {
                img.mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
        let traces = LineExtractor::default().extract(&img, &m);
        let (x0, x1) = m.band_bounds(6, 720);
        for p in &traces[6].points {
            assert_abs_diff_eq!(p.x, 0.5 * (x0 + x1), epsilon = 1e-9);
        }
    }

    #[test]
    fn specks_are_removed_before_tracing() {
        let m = model();
        let mut img = rectified(|i| {
            if i == 2 {
                LineStyle::Absent
            } else {
                LineStyle::Straight
            }
        });
        let (x0, x1) = m.band_bounds(2, 720);
        let cx = (0.5 * (x0 + x1)) as u32;
        for y in (30..370).step_by(9) {
            img.mask.put_pixel(cx, y, Luma([FOREGROUND]));
        }
        let traces = LineExtractor::default().extract(&img, &m);
        assert!(traces[2].points.is_empty());
        assert!(traces[2].incomplete);
    }
}
