use serde::{Deserialize, Serialize};

use super::PixelMapper;

/// Pinhole camera intrinsics in pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Finite values with non-zero focal lengths.
    pub fn is_valid(self) -> bool {
        [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .all(|v| v.is_finite())
            && self.fx.abs() > 1e-12
            && self.fy.abs() > 1e-12
    }

    pub fn pixel_to_normalized(self, pixel_xy: [f64; 2]) -> Option<[f64; 2]> {
        if !self.is_valid() {
            return None;
        }
        finite([
            (pixel_xy[0] - self.cx) / self.fx,
            (pixel_xy[1] - self.cy) / self.fy,
        ])
    }

    pub fn normalized_to_pixel(self, normalized_xy: [f64; 2]) -> [f64; 2] {
        [
            self.fx * normalized_xy[0] + self.cx,
            self.fy * normalized_xy[1] + self.cy,
        ]
    }
}

/// Brown-Conrady radial-tangential coefficients.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RadialTangentialDistortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl RadialTangentialDistortion {
    fn radial(self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    fn tangential(self, x: f64, y: f64) -> [f64; 2] {
        let r2 = x * x + y * y;
        [
            2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        ]
    }

    /// Apply distortion to normalized coordinates.
    pub fn distort_normalized(self, normalized_xy: [f64; 2]) -> [f64; 2] {
        let [x, y] = normalized_xy;
        let radial = self.radial(x * x + y * y);
        let [tx, ty] = self.tangential(x, y);
        [x * radial + tx, y * radial + ty]
    }
}

/// Fixed-point settings for inverting the Brown-Conrady model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UndistortConfig {
    pub max_iters: usize,
    /// Stop when the update norm drops below this value.
    pub eps: f64,
}

impl Default for UndistortConfig {
    fn default() -> Self {
        Self {
            max_iters: 15,
            eps: 1e-12,
        }
    }
}

/// Intrinsics plus radial-tangential distortion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CameraModel {
    pub intrinsics: CameraIntrinsics,
    pub distortion: RadialTangentialDistortion,
}

impl CameraModel {
    pub fn distort_pixel(self, undistorted_xy: [f64; 2]) -> Option<[f64; 2]> {
        let n = self.intrinsics.pixel_to_normalized(undistorted_xy)?;
        finite(
            self.intrinsics
                .normalized_to_pixel(self.distortion.distort_normalized(n)),
        )
    }

    pub fn undistort_pixel(self, distorted_xy: [f64; 2]) -> Option<[f64; 2]> {
        self.undistort_pixel_with(distorted_xy, UndistortConfig::default())
    }

    pub fn undistort_pixel_with(
        self,
        distorted_xy: [f64; 2],
        cfg: UndistortConfig,
    ) -> Option<[f64; 2]> {
        let target = self.intrinsics.pixel_to_normalized(distorted_xy)?;
        let mut p = target;
        for _ in 0..cfg.max_iters.max(1) {
            let radial = self.distortion.radial(p[0] * p[0] + p[1] * p[1]);
            if !radial.is_finite() || radial.abs() < 1e-12 {
                return None;
            }
            let [tx, ty] = self.distortion.tangential(p[0], p[1]);
            let next = finite([(target[0] - tx) / radial, (target[1] - ty) / radial])?;
            let step = (next[0] - p[0]).hypot(next[1] - p[1]);
            p = next;
            if step <= cfg.eps.max(0.0) {
                break;
            }
        }
        finite(self.intrinsics.normalized_to_pixel(p))
    }
}

impl PixelMapper for CameraModel {
    fn image_to_working_pixel(&self, image_xy: [f64; 2]) -> Option<[f64; 2]> {
        self.undistort_pixel(image_xy)
    }

    fn working_to_image_pixel(&self, working_xy: [f64; 2]) -> Option<[f64; 2]> {
        self.distort_pixel(working_xy)
    }
}

fn finite(p: [f64; 2]) -> Option<[f64; 2]> {
    (p[0].is_finite() && p[1].is_finite()).then_some(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn model() -> CameraModel {
        CameraModel {
            intrinsics: CameraIntrinsics {
                fx: 900.0,
                fy: 880.0,
                cx: 640.0,
                cy: 360.0,
            },
            distortion: RadialTangentialDistortion {
                k1: -0.12,
                k2: 0.03,
                p1: 0.001,
                p2: -0.0007,
                k3: 0.0,
            },
        }
    }

    #[test]
    fn undistort_inverts_distort() {
        let m = model();
        for p in [[640.0, 360.0], [100.0, 80.0], [1180.0, 650.0], [900.0, 200.0]] {
            let d = m.distort_pixel(p).unwrap();
            let u = m.undistort_pixel(d).unwrap();
            assert_abs_diff_eq!(u[0], p[0], epsilon = 1e-4);
            assert_abs_diff_eq!(u[1], p[1], epsilon = 1e-4);
        }
    }

    #[test]
    fn invalid_intrinsics_map_to_none() {
        let mut m = model();
        m.intrinsics.fx = 0.0;
        assert!(m.image_to_working_pixel([10.0, 10.0]).is_none());
    }
}
