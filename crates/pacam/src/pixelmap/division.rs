use serde::{Deserialize, Serialize};

use super::PixelMapper;

const FIXED_POINT_ITERS: usize = 20;
const FIXED_POINT_TOL: f64 = 1e-12;

/// Single-parameter division distortion model: `p_u = c + (p_d - c) / (1 + lambda r_d^2)`.
///
/// Negative `lambda` corresponds to barrel distortion, the usual case for wide printer
/// cameras; positive to pincushion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DivisionModel {
    /// Distortion parameter in 1/px².
    pub lambda: f64,
    /// Distortion centre x (pixels).
    pub cx: f64,
    /// Distortion centre y (pixels).
    pub cy: f64,
}

impl DivisionModel {
    pub fn new(lambda: f64, cx: f64, cy: f64) -> Self {
        Self { lambda, cx, cy }
    }

    /// Model centred on an image of the given size.
    pub fn centered(lambda: f64, width: u32, height: u32) -> Self {
        Self::new(lambda, width as f64 / 2.0, height as f64 / 2.0)
    }

    /// Distorted -> undistorted (closed form).
    pub fn undistort_point(&self, distorted_xy: [f64; 2]) -> Option<[f64; 2]> {
        let dx = distorted_xy[0] - self.cx;
        let dy = distorted_xy[1] - self.cy;
        let denom = 1.0 + self.lambda * (dx * dx + dy * dy);
        if !denom.is_finite() || denom.abs() < 1e-12 {
            return None;
        }
        Some([self.cx + dx / denom, self.cy + dy / denom])
    }

    /// Undistorted -> distorted by fixed-point iteration on `d = u (1 + lambda |d|^2)`.
    pub fn distort_point(&self, undistorted_xy: [f64; 2]) -> Option<[f64; 2]> {
        if self.lambda == 0.0 {
            return Some(undistorted_xy);
        }
        let u = [undistorted_xy[0] - self.cx, undistorted_xy[1] - self.cy];
        let mut d = u;
        for _ in 0..FIXED_POINT_ITERS {
            let factor = 1.0 + self.lambda * (d[0] * d[0] + d[1] * d[1]);
            let next = [u[0] * factor, u[1] * factor];
            if !next[0].is_finite() || !next[1].is_finite() {
                return None;
            }
            let step = (next[0] - d[0]).hypot(next[1] - d[1]);
            d = next;
            if step < FIXED_POINT_TOL {
                break;
            }
        }
        Some([self.cx + d[0], self.cy + d[1]])
    }
}

impl PixelMapper for DivisionModel {
    fn image_to_working_pixel(&self, image_xy: [f64; 2]) -> Option<[f64; 2]> {
        self.undistort_point(image_xy)
    }

    fn working_to_image_pixel(&self, working_xy: [f64; 2]) -> Option<[f64; 2]> {
        self.distort_point(working_xy)
    }
}
