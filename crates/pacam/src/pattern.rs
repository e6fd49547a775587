//! Printed calibration pattern geometry.
//!
//! The pattern is a row of parallel line segments, one per PA value, enclosed by a
//! double-printed outline rectangle. Across the lines the layout is:
//!
//! ```text
//! | 2 spacings | line 0 | line 1 | ... | line n-1 | 2 spacings |
//! ```
//!
//! with line `i` centred `(i + 2) * line_spacing_mm` from the leading outline edge, so
//! the total extent across lines is `(line_count + 3) * line_spacing_mm`. Along the lines
//! the extent is `pattern_width_mm`.

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};

const DEFAULT_PA_START: f64 = 0.0;
const DEFAULT_PA_END: f64 = 0.1;
const DEFAULT_PA_STEP: f64 = 0.005;
const DEFAULT_LINE_SPACING_MM: f64 = 3.0;
const DEFAULT_PATTERN_WIDTH_MM: f64 = 40.0;
const DEFAULT_X_START: f64 = 2.0;
const DEFAULT_Y_START: f64 = 2.0;

/// Leading and trailing margin across the lines, in line spacings.
const MARGIN_SPACINGS: f64 = 2.0;

/// Relative slack when flooring `(end - start) / step`.
const LINE_COUNT_EPS: f64 = 1e-9;

/// Upper bound on the number of printed lines.
pub const MAX_LINE_COUNT: usize = 10_000;

/// Raw pattern parameters as configured for the print.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatternConfig {
    /// PA value of the first line.
    pub pa_start: f64,
    /// PA value of the last line (inclusive when reachable by whole steps).
    pub pa_end: f64,
    /// PA increment between neighbouring lines. Must be > 0.
    pub pa_step: f64,
    /// Distance between line centres in mm.
    #[serde(alias = "line_spacing")]
    pub line_spacing_mm: f64,
    /// Physical length of the pattern along the lines in mm.
    #[serde(alias = "width")]
    pub pattern_width_mm: f64,
    /// Bed X of the pattern's outline corner in mm.
    pub x_start: f64,
    /// Bed Y of the pattern's outline corner in mm.
    pub y_start: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            pa_start: DEFAULT_PA_START,
            pa_end: DEFAULT_PA_END,
            pa_step: DEFAULT_PA_STEP,
            line_spacing_mm: DEFAULT_LINE_SPACING_MM,
            pattern_width_mm: DEFAULT_PATTERN_WIDTH_MM,
            x_start: DEFAULT_X_START,
            y_start: DEFAULT_Y_START,
        }
    }
}

/// Camera placement relative to the nozzle, used to position the head for the photo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraPlacement {
    /// X offset from nozzle to camera in mm, negative is left of the nozzle.
    pub camera_offset_x: f64,
    /// Y offset from nozzle to camera in mm, negative is in front of the nozzle.
    pub camera_offset_y: f64,
    /// Nozzle height for the photo in mm.
    pub photo_height: f64,
}

impl Default for CameraPlacement {
    fn default() -> Self {
        Self {
            camera_offset_x: 0.0,
            camera_offset_y: 0.0,
            photo_height: 50.0,
        }
    }
}

/// Validated, immutable pattern geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PatternModel {
    pub pa_start: f64,
    pub pa_end: f64,
    pub pa_step: f64,
    pub line_count: usize,
    pub line_spacing_mm: f64,
    pub pattern_width_mm: f64,
    pub x_start: f64,
    pub y_start: f64,
}

impl PatternModel {
    /// Build the model, rejecting parameters that cannot describe a printable pattern.
    pub fn new(config: &PatternConfig) -> Result<Self> {
        validate_pattern_config(config).map_err(CalibrationError::Configuration)?;

        let line_count = line_intervals(config.pa_start, config.pa_end, config.pa_step) as usize + 1;

        Ok(Self {
            pa_start: config.pa_start,
            pa_end: config.pa_end,
            pa_step: config.pa_step,
            line_count,
            line_spacing_mm: config.line_spacing_mm,
            pattern_width_mm: config.pattern_width_mm,
            x_start: config.x_start,
            y_start: config.y_start,
        })
    }

    /// PA value printed on line `index`.
    pub fn index_to_pa(&self, index: usize) -> f64 {
        self.pa_start + index as f64 * self.pa_step
    }

    /// Nearest line index for a PA value, clamped to the printed range.
    pub fn pa_to_index(&self, pa: f64) -> usize {
        let raw = ((pa - self.pa_start) / self.pa_step).round();
        if !raw.is_finite() || raw <= 0.0 {
            return 0;
        }
        (raw as usize).min(self.line_count - 1)
    }

    /// `(index, pa)` pairs for every printed line.
    pub fn pa_table(&self) -> Vec<(usize, f64)> {
        (0..self.line_count)
            .map(|i| (i, self.index_to_pa(i)))
            .collect()
    }

    /// Physical extent `[across_lines, along_lines]` in mm.
    pub fn pattern_extent_mm(&self) -> [f64; 2] {
        [
            (self.line_count as f64 + 2.0 * MARGIN_SPACINGS - 1.0) * self.line_spacing_mm,
            self.pattern_width_mm,
        ]
    }

    /// Distance of line `index`'s centre from the leading outline edge in mm.
    pub fn line_center_mm(&self, index: usize) -> f64 {
        (index as f64 + MARGIN_SPACINGS) * self.line_spacing_mm
    }

    /// Expected horizontal extent `(x_min, x_max)` of line `index` in a rectified image
    /// of width `rectified_width` pixels.
    ///
    /// Bands are one line spacing wide and centred on the line, so neighbouring bands
    /// touch but never overlap.
    pub fn band_bounds(&self, index: usize, rectified_width: u32) -> (f64, f64) {
        let px_per_mm = rectified_width as f64 / self.pattern_extent_mm()[0];
        let center = self.line_center_mm(index) * px_per_mm;
        let half = 0.5 * self.line_spacing_mm * px_per_mm;
        (center - half, center + half)
    }

    /// Nozzle position `[x, y, z]` that centres the camera over the pattern.
    ///
    /// The pattern's long side runs along bed Y. Coordinates are clamped at 0.
    pub fn photo_position(&self, camera: &CameraPlacement) -> [f64; 3] {
        let [across, along] = self.pattern_extent_mm();
        let x_center = self.x_start + along / 2.0;
        let y_center = self.y_start + across / 2.0;
        [
            (x_center - camera.camera_offset_x).max(0.0),
            (y_center - camera.camera_offset_y).max(0.0),
            camera.photo_height,
        ]
    }
}

/// Whole PA steps that fit in `[start, end]`.
fn line_intervals(pa_start: f64, pa_end: f64, pa_step: f64) -> f64 {
    let span = (pa_end - pa_start) / pa_step;
    (span + LINE_COUNT_EPS * span.abs().max(1.0)).floor()
}

fn validate_pattern_config(config: &PatternConfig) -> std::result::Result<(), String> {
    let fields = [
        ("pa_start", config.pa_start),
        ("pa_end", config.pa_end),
        ("pa_step", config.pa_step),
        ("line_spacing_mm", config.line_spacing_mm),
        ("pattern_width_mm", config.pattern_width_mm),
        ("x_start", config.x_start),
        ("y_start", config.y_start),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Err(format!("{name} must be finite"));
        }
    }

    if config.pa_step <= 0.0 {
        return Err(format!("pa_step must be > 0 (got {})", config.pa_step));
    }
    if config.pa_end < config.pa_start {
        return Err(format!(
            "pa_end ({}) must be >= pa_start ({})",
            config.pa_end, config.pa_start
        ));
    }
    let intervals = line_intervals(config.pa_start, config.pa_end, config.pa_step);
    if !intervals.is_finite() || intervals >= MAX_LINE_COUNT as f64 {
        return Err(format!(
            "PA range {}..{} step {} gives more than {MAX_LINE_COUNT} lines",
            config.pa_start, config.pa_end, config.pa_step
        ));
    }
    if config.line_spacing_mm <= 0.0 {
        return Err("line_spacing_mm must be > 0".to_string());
    }
    if config.pattern_width_mm <= 0.0 {
        return Err("pattern_width_mm must be > 0".to_string());
    }
    Ok(())
}
