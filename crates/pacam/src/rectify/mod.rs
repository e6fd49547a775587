//! Geometric rectification: raw photo + foreground mask -> top-down canonical image.
//!
//! Stages:
//! 1. clean a copy of the mask (open/close) for contour search only;
//! 2. take the largest external contour, undistort it, and fit a quadrilateral whose
//!    sides are refitted to the contour;
//! 3. check the corners describe a plausible rectangle;
//! 4. fit the canonical -> undistorted homography and resample through it and the lens
//!    model.
//!
//! In the output the pattern lines are vertical and band `i` sits where
//! [`PatternModel::band_bounds`] predicts.

mod outline;
mod warp;

use image::{imageops, GrayImage};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::capture::RawImage;
use crate::error::{CalibrationError, Result};
use crate::homography::{estimate_homography_dlt, reprojection_error, to_array};
use crate::mask::ForegroundMask;
use crate::pattern::PatternModel;
use crate::pixelmap::LensDistortion;

pub use outline::QuadSource;

/// Largest canonical frame we are willing to allocate.
const MAX_CANONICAL_PIXELS: u64 = 40_000_000;

/// How the printed lines appear in the photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineAxis {
    /// Decide from the outline's side lengths and the pattern's physical aspect.
    #[default]
    Auto,
    /// Lines run top-to-bottom in the photo; band 0 is on the left.
    ImageVertical,
    /// Lines run left-to-right in the photo; band 0 is at the top.
    ImageHorizontal,
}

/// Rectification parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectifyConfig {
    /// Output resolution of the canonical frame.
    pub px_per_mm: f64,
    /// Structuring-element radius (L∞) for mask cleaning; 2 gives a 5x5 square.
    pub clean_radius: u8,
    pub open_iterations: usize,
    pub close_iterations: usize,
    /// Absolute lower bound on the outline contour area.
    pub min_contour_area_px: f64,
    /// Lower bound on the outline contour area as a fraction of the photo.
    pub min_area_fraction: f64,
    /// Douglas-Peucker tolerances (× perimeter) tried in order until four corners remain.
    pub polygon_epsilon_scales: Vec<f64>,
    /// Maximum deviation of any corner angle from 90°, in degrees.
    pub max_corner_angle_deviation_deg: f64,
    /// Allowed relative error between the outline's and the pattern's aspect ratios.
    pub aspect_tolerance: f64,
    pub line_axis: LineAxis,
    /// Mirror the band order (first line on the right of the rectified image).
    pub flip_horizontal: bool,
}

impl Default for RectifyConfig {
    fn default() -> Self {
        Self {
            px_per_mm: 10.0,
            clean_radius: 2,
            open_iterations: 4,
            close_iterations: 4,
            min_contour_area_px: 1000.0,
            min_area_fraction: 0.01,
            polygon_epsilon_scales: vec![0.01, 0.02, 0.03, 0.05, 0.07, 0.1],
            max_corner_angle_deviation_deg: 30.0,
            aspect_tolerance: 0.6,
            line_axis: LineAxis::Auto,
            flip_horizontal: false,
        }
    }
}

impl RectifyConfig {
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if !self.px_per_mm.is_finite() || self.px_per_mm <= 0.0 {
            return Err("rectify.px_per_mm must be finite and > 0".to_string());
        }
        if !(0.0..1.0).contains(&self.min_area_fraction) {
            return Err("rectify.min_area_fraction must be in [0, 1)".to_string());
        }
        if self.polygon_epsilon_scales.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err("rectify.polygon_epsilon_scales must be finite and > 0".to_string());
        }
        if !(0.0..90.0).contains(&self.max_corner_angle_deviation_deg) {
            return Err("rectify.max_corner_angle_deviation_deg must be in [0, 90)".to_string());
        }
        if !self.aspect_tolerance.is_finite() || self.aspect_tolerance < 0.0 {
            return Err("rectify.aspect_tolerance must be >= 0".to_string());
        }
        Ok(())
    }
}

/// Geometry recorded for traceability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectificationInfo {
    /// Canonical pixel -> undistorted raw pixel (row-major 3x3).
    pub homography: [[f64; 3]; 3],
    /// Outline corners in raw pixels: top-left, top-right, bottom-right, bottom-left.
    pub corners_px: [[f64; 2]; 4],
    pub quad_source: QuadSource,
    pub contour_area_px: f64,
    pub max_corner_deviation_deg: f64,
    /// Lines appeared horizontal in the photo and the frame was turned.
    pub rotated: bool,
    pub flipped: bool,
    pub source_size: [u32; 2],
    pub output_size: [u32; 2],
}

/// Top-down view of the pattern with lines running vertically.
#[derive(Debug, Clone)]
pub struct RectifiedImage {
    pub image: GrayImage,
    pub mask: GrayImage,
    pub px_per_mm: f64,
    pub info: RectificationInfo,
}

impl RectifiedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Wrap an already-canonical frame (no warp applied).
    pub fn from_canonical(image: GrayImage, mask: GrayImage, px_per_mm: f64) -> Self {
        let (w, h) = image.dimensions();
        let (wf, hf) = (w as f64, h as f64);
        Self {
            image,
            mask,
            px_per_mm,
            info: RectificationInfo {
                homography: to_array(&Matrix3::identity()),
                corners_px: [[0.0, 0.0], [wf, 0.0], [wf, hf], [0.0, hf]],
                quad_source: QuadSource::MinAreaRect,
                contour_area_px: wf * hf,
                max_corner_deviation_deg: 0.0,
                rotated: false,
                flipped: false,
                source_size: [w, h],
                output_size: [w, h],
            },
        }
    }
}

/// Detects the outline and produces the canonical view.
#[derive(Debug, Clone, Default)]
pub struct GeometricRectifier {
    config: RectifyConfig,
    lens: LensDistortion,
}

impl GeometricRectifier {
    pub fn new(config: RectifyConfig, lens: LensDistortion) -> Self {
        Self { config, lens }
    }

    pub fn config(&self) -> &RectifyConfig {
        &self.config
    }

    /// Canonical frame size `[width, height]` for `pattern`.
    pub fn canonical_size(&self, pattern: &PatternModel) -> Result<[u32; 2]> {
        let [across, along] = pattern.pattern_extent_mm();
        let w = (across * self.config.px_per_mm).round().max(1.0);
        let h = (along * self.config.px_per_mm).round().max(1.0);
        if w * h > MAX_CANONICAL_PIXELS as f64 {
            return Err(CalibrationError::Configuration(format!(
                "canonical frame {w}x{h} exceeds {MAX_CANONICAL_PIXELS} pixels; lower px_per_mm"
            )));
        }
        Ok([w as u32, h as u32])
    }

    pub fn rectify(
        &self,
        raw: &RawImage,
        mask: &ForegroundMask,
        pattern: &PatternModel,
    ) -> Result<RectifiedImage> {
        let cfg = &self.config;
        let (w, h) = raw.dimensions();
        if mask.dimensions() != (w, h) {
            return Err(CalibrationError::PatternNotFound(format!(
                "mask is {}x{} but photo is {w}x{h}",
                mask.width(),
                mask.height()
            )));
        }
        let [out_w, out_h] = self.canonical_size(pattern)?;

        let mapper = self.lens.mapper(w, h);
        let cleaned = mask.cleaned(cfg.clean_radius, cfg.open_iterations, cfg.close_iterations);
        let outline = outline::find_outline(&cleaned, cfg, &mapper)?;
        let undistorted = outline.undistorted;

        let deviation = outline::max_corner_deviation_deg(&undistorted);
        if deviation > cfg.max_corner_angle_deviation_deg {
            return Err(CalibrationError::PatternNotFound(format!(
                "outline corner deviates {deviation:.1}° from rectangular (limit {:.1}°)",
                cfg.max_corner_angle_deviation_deg
            )));
        }

        let [across, along] = pattern.pattern_extent_mm();
        let (horizontal, vertical) = outline::side_lengths(&undistorted);
        let rotated = match cfg.line_axis {
            LineAxis::ImageVertical => false,
            LineAxis::ImageHorizontal => true,
            LineAxis::Auto => (horizontal >= vertical) != (across >= along),
        };
        check_aspect(horizontal, vertical, across, along, cfg.aspect_tolerance)?;

        // Canonical corner k maps to photo corner `order[k]`.
        let order: [usize; 4] = match (rotated, cfg.flip_horizontal) {
            (false, false) => [0, 1, 2, 3],
            (false, true) => [1, 0, 3, 2],
            (true, false) => [1, 2, 3, 0],
            (true, true) => [2, 1, 0, 3],
        };
        let (wf, hf) = (out_w as f64, out_h as f64);
        let canonical = [[0.0, 0.0], [wf, 0.0], [wf, hf], [0.0, hf]];
        let targets = order.map(|k| undistorted[k]);
        let homography = estimate_homography_dlt(&canonical, &targets)?;
        let corner_residual = canonical
            .iter()
            .zip(&targets)
            .map(|(s, d)| reprojection_error(&homography, s, d))
            .fold(0.0f64, f64::max);

        tracing::debug!(
            "Rectifying {}x{} -> {}x{} (rotated={}, flipped={}, corner deviation {:.1}°, residual {:.2e} px)",
            w,
            h,
            out_w,
            out_h,
            rotated,
            cfg.flip_horizontal,
            deviation,
            corner_residual
        );

        let gray = imageops::grayscale(raw.pixels());
        let warped = warp::warp_to_canonical(
            &gray,
            mask.as_image(),
            &homography,
            &mapper,
            out_w,
            out_h,
        );

        Ok(RectifiedImage {
            image: warped.image,
            mask: warped.mask,
            px_per_mm: wf / across,
            info: RectificationInfo {
                homography: to_array(&homography),
                corners_px: outline.corners,
                quad_source: outline.source,
                contour_area_px: outline.contour_area_px,
                max_corner_deviation_deg: deviation,
                rotated,
                flipped: cfg.flip_horizontal,
                source_size: [w, h],
                output_size: [out_w, out_h],
            },
        })
    }
}

/// Compare long/short side ratios of the outline and the physical pattern.
fn check_aspect(
    horizontal: f64,
    vertical: f64,
    across: f64,
    along: f64,
    tolerance: f64,
) -> Result<()> {
    let short = horizontal.min(vertical);
    if short < 1.0 {
        return Err(CalibrationError::PatternNotFound(
            "outline collapsed to a line".to_string(),
        ));
    }
    let observed = horizontal.max(vertical) / short;
    let expected = across.max(along) / across.min(along);
    let rel = (observed / expected - 1.0).abs();
    if rel > tolerance {
        return Err(CalibrationError::PatternNotFound(format!(
            "outline aspect {observed:.2} vs expected {expected:.2} (tolerance {tolerance:.2})"
        )));
    }
    Ok(())
}
