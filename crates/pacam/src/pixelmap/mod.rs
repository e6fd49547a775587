//! Lens-distortion models mapping between raw photo pixels and undistorted pixels.
//!
//! The rectifier detects corners in raw (distorted) pixels, undistorts them to fit the
//! perspective transform, then re-distorts every canonical sample location to read the
//! raw photo. Both directions go through [`PixelMapper`].

mod brown;
mod division;

use serde::{Deserialize, Serialize};

pub use brown::{CameraIntrinsics, CameraModel, RadialTangentialDistortion, UndistortConfig};
pub use division::DivisionModel;

/// Mapping between raw image pixels and undistorted working pixels.
///
/// Both methods must be approximate inverses of each other. Return `None` if a point
/// falls outside the valid domain of the model.
///
/// # Example
///
/// ```
/// use pacam::PixelMapper;
///
/// struct Identity;
///
/// impl PixelMapper for Identity {
///     fn image_to_working_pixel(&self, p: [f64; 2]) -> Option<[f64; 2]> {
///         Some(p)
///     }
///     fn working_to_image_pixel(&self, p: [f64; 2]) -> Option<[f64; 2]> {
///         Some(p)
///     }
/// }
/// ```
pub trait PixelMapper {
    /// Raw (distorted) pixel -> undistorted working pixel.
    fn image_to_working_pixel(&self, image_xy: [f64; 2]) -> Option<[f64; 2]>;
    /// Undistorted working pixel -> raw (distorted) pixel.
    fn working_to_image_pixel(&self, working_xy: [f64; 2]) -> Option<[f64; 2]>;
}

/// Configured lens-distortion correction.
///
/// The default is [`LensDistortion::None`]: many printer cameras are close enough to a
/// pinhole over the small pattern area, and coefficients are camera-specific.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum LensDistortion {
    /// No correction.
    #[default]
    None,
    /// Single-parameter division model. The centre defaults to the image centre.
    Division {
        lambda: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        center: Option<[f64; 2]>,
    },
    /// Calibrated pinhole intrinsics plus Brown-Conrady coefficients.
    RadialTangential {
        intrinsics: CameraIntrinsics,
        #[serde(default)]
        distortion: RadialTangentialDistortion,
    },
}

impl LensDistortion {
    /// Instantiate the mapper for a photo of `width x height` pixels.
    pub fn mapper(&self, width: u32, height: u32) -> LensMapper {
        match *self {
            Self::None => LensMapper::Identity,
            Self::Division { lambda, center } => LensMapper::Division(match center {
                Some([cx, cy]) => DivisionModel::new(lambda, cx, cy),
                None => DivisionModel::centered(lambda, width, height),
            }),
            Self::RadialTangential {
                intrinsics,
                distortion,
            } => LensMapper::Camera(CameraModel {
                intrinsics,
                distortion,
            }),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Self::None => Ok(()),
            Self::Division { lambda, center } => {
                if !lambda.is_finite() {
                    return Err("division lambda must be finite".to_string());
                }
                if center.is_some_and(|c| !c[0].is_finite() || !c[1].is_finite()) {
                    return Err("division center must be finite".to_string());
                }
                Ok(())
            }
            Self::RadialTangential { intrinsics, .. } => {
                if intrinsics.is_valid() {
                    Ok(())
                } else {
                    Err("camera intrinsics must be finite with non-zero focal lengths".to_string())
                }
            }
        }
    }
}

/// Concrete mapper built from a [`LensDistortion`] for one image size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LensMapper {
    Identity,
    Division(DivisionModel),
    Camera(CameraModel),
}

impl PixelMapper for LensMapper {
    fn image_to_working_pixel(&self, image_xy: [f64; 2]) -> Option<[f64; 2]> {
        match self {
            Self::Identity => Some(image_xy),
            Self::Division(m) => m.image_to_working_pixel(image_xy),
            Self::Camera(m) => m.image_to_working_pixel(image_xy),
        }
    }

    fn working_to_image_pixel(&self, working_xy: [f64; 2]) -> Option<[f64; 2]> {
        match self {
            Self::Identity => Some(working_xy),
            Self::Division(m) => m.working_to_image_pixel(working_xy),
            Self::Camera(m) => m.working_to_image_pixel(working_xy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn default_is_identity() {
        let mapper = LensDistortion::default().mapper(640, 480);
        assert_eq!(mapper, LensMapper::Identity);
        assert_eq!(mapper.image_to_working_pixel([12.5, 7.0]), Some([12.5, 7.0]));
    }

    #[test]
    fn division_center_defaults_to_image_center() {
        let mapper = LensDistortion::Division {
            lambda: -1e-7,
            center: None,
        }
        .mapper(800, 600);
        match mapper {
            LensMapper::Division(m) => {
                assert_abs_diff_eq!(m.cx, 400.0);
                assert_abs_diff_eq!(m.cy, 300.0);
            }
            other => panic!("unexpected mapper {other:?}"),
        }
    }

    #[test]
    fn config_json_is_tagged() {
        let json = r#"{"model":"division","lambda":-2e-7}"#;
        let lens: LensDistortion = serde_json::from_str(json).unwrap();
        assert_eq!(
            lens,
            LensDistortion::Division {
                lambda: -2e-7,
                center: None
            }
        );
        assert!(lens.validate().is_ok());

        let bad = LensDistortion::RadialTangential {
            intrinsics: CameraIntrinsics {
                fx: 0.0,
                fy: 900.0,
                cx: 320.0,
                cy: 240.0,
            },
            distortion: RadialTangentialDistortion::default(),
        };
        assert!(bad.validate().is_err());
    }
}
