//! Synthetic pattern images shared by unit tests.

use image::{GrayImage, Luma};

use crate::homography::{estimate_homography_dlt, project};
use crate::mask::FOREGROUND;
use crate::pattern::PatternModel;
use crate::pixelmap::{LensMapper, PixelMapper};

pub(crate) const FILAMENT_LEVEL: u8 = 200;
pub(crate) const BED_LEVEL: u8 = 40;
pub(crate) const OUTSIDE_LEVEL: u8 = 20;

/// Shape of one printed line in the canonical frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum LineStyle {
    Straight,
    /// Centre x oscillates by `amplitude_px` with the given period along the line.
    Sinusoidal { amplitude_px: f64, period_px: f64 },
    /// Line printed only between the given row fractions.
    Partial { from: f64, to: f64 },
    Absent,
}

pub(crate) struct SyntheticPattern {
    pub model: PatternModel,
    pub px_per_mm: f64,
    pub line_width_px: u32,
    pub outline_px: u32,
    pub styles: Vec<LineStyle>,
}

impl SyntheticPattern {
    pub fn new(model: PatternModel, px_per_mm: f64, style: impl Fn(usize) -> LineStyle) -> Self {
        Self {
            model,
            px_per_mm,
            line_width_px: 6,
            outline_px: (px_per_mm).round().max(2.0) as u32,
            styles: (0..model.line_count).map(style).collect(),
        }
    }

    pub fn canonical_size(&self) -> (u32, u32) {
        let [across, along] = self.model.pattern_extent_mm();
        (
            (across * self.px_per_mm).round() as u32,
            (along * self.px_per_mm).round() as u32,
        )
    }
}

/// Render the canonical (already rectified) view: `(gray, mask)`.
///
/// The outline occupies the outermost `outline_px` pixels; every line spans the full
/// height and touches the outline, as printed.
pub(crate) fn render_canonical(p: &SyntheticPattern) -> (GrayImage, GrayImage) {
    let (w, h) = p.canonical_size();
    let mut mask = GrayImage::new(w, h);
    let t = p.outline_px;
    for y in 0..h {
        for x in 0..w {
            if x < t || y < t || x + t >= w || y + t >= h {
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
    }

    for (i, style) in p.styles.iter().enumerate() {
        let center = p.model.line_center_mm(i) * p.px_per_mm;
        for y in 0..h {
            let fy = y as f64 / h as f64;
            let cx = match *style {
                LineStyle::Straight => center,
                LineStyle::Sinusoidal {
                    amplitude_px,
                    period_px,
                } => center + amplitude_px * (std::f64::consts::TAU * y as f64 / period_px).sin(),
                LineStyle::Partial { from, to } if fy >= from && fy < to => center,
                LineStyle::Partial { .. } | LineStyle::Absent => continue,
            };
            let start = (cx - p.line_width_px as f64 / 2.0).round().max(0.0) as u32;
            for x in start..(start + p.line_width_px).min(w) {
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
    }

    let gray = GrayImage::from_fn(w, h, |x, y| {
        Luma([if mask.get_pixel(x, y)[0] == FOREGROUND {
            FILAMENT_LEVEL
        } else {
            BED_LEVEL
        }])
    });
    (gray, mask)
}

/// Render the pattern as seen by a camera: the canonical frame's corners land on
/// `corners` (top-left, top-right, bottom-right, bottom-left of the canonical frame).
pub(crate) fn render_photo(
    p: &SyntheticPattern,
    width: u32,
    height: u32,
    corners: [[f64; 2]; 4],
) -> (GrayImage, GrayImage) {
    render_photo_with_lens(p, width, height, corners, &LensMapper::Identity)
}

/// [`render_photo`] through a lens: `corners` are undistorted positions and every raw
/// pixel is undistorted by `lens` before the canonical lookup.
pub(crate) fn render_photo_with_lens(
    p: &SyntheticPattern,
    width: u32,
    height: u32,
    corners: [[f64; 2]; 4],
    lens: &dyn PixelMapper,
) -> (GrayImage, GrayImage) {
    let (cw, ch) = p.canonical_size();
    let (canon_gray, canon_mask) = render_canonical(p);
    let (wf, hf) = (cw as f64, ch as f64);
    let src = [[0.0, 0.0], [wf, 0.0], [wf, hf], [0.0, hf]];
    let h = estimate_homography_dlt(&src, &corners).expect("synthetic homography");
    let h_inv = h.try_inverse().expect("invertible synthetic homography");

    let mut gray = GrayImage::from_pixel(width, height, Luma([OUTSIDE_LEVEL]));
    let mut mask = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let Some(working) = lens.image_to_working_pixel([x as f64 + 0.5, y as f64 + 0.5]) else {
                continue;
            };
            let c = project(&h_inv, working[0], working[1]);
            if !(c[0] >= 0.0 && c[1] >= 0.0 && c[0] < wf && c[1] < hf) {
                continue;
            }
            let (u, v) = (c[0] as u32, c[1] as u32);
            gray.put_pixel(x, y, *canon_gray.get_pixel(u, v));
            mask.put_pixel(x, y, *canon_mask.get_pixel(u, v));
        }
    }
    (gray, mask)
}
