//! Inverse-mapped resampling from the raw photo into the canonical frame.

use image::{GrayImage, Luma};
use nalgebra::Matrix3;

use crate::homography::project;
use crate::mask::{BACKGROUND, FOREGROUND};
use crate::pixelmap::PixelMapper;

/// Rectified intensity and mask buffers.
pub(crate) struct Warped {
    pub image: GrayImage,
    pub mask: GrayImage,
}

/// Fill a `width x height` canonical frame.
///
/// Canonical pixel centres go through `h` (canonical -> undistorted raw), then the
/// lens mapper (undistorted -> distorted raw). Intensity is sampled bilinearly, the
/// mask by nearest neighbour. Samples falling outside the photo become background.
pub(crate) fn warp_to_canonical(
    gray: &GrayImage,
    mask: &GrayImage,
    h: &Matrix3<f64>,
    mapper: &dyn PixelMapper,
    width: u32,
    height: u32,
) -> Warped {
    let mut image = GrayImage::new(width, height);
    let mut out_mask = GrayImage::new(width, height);

    for v in 0..height {
        for u in 0..width {
            let undistorted = project(h, u as f64 + 0.5, v as f64 + 0.5);
            if !undistorted[0].is_finite() || !undistorted[1].is_finite() {
                continue;
            }
            let Some(raw) = mapper.working_to_image_pixel(undistorted) else {
                continue;
            };
            // Continuous coordinates -> pixel-index coordinates.
            let sx = raw[0] - 0.5;
            let sy = raw[1] - 0.5;
            if let Some(value) = sample_bilinear(gray, sx, sy) {
                image.put_pixel(u, v, Luma([value]));
            }
            let fg = sample_nearest(mask, sx, sy).is_some_and(|m| m == FOREGROUND);
            out_mask.put_pixel(u, v, Luma([if fg { FOREGROUND } else { BACKGROUND }]));
        }
    }

    Warped {
        image,
        mask: out_mask,
    }
}

fn sample_nearest(img: &GrayImage, x: f64, y: f64) -> Option<u8> {
    let xi = x.round();
    let yi = y.round();
    if xi < 0.0 || yi < 0.0 || xi >= img.width() as f64 || yi >= img.height() as f64 {
        return None;
    }
    Some(img.get_pixel(xi as u32, yi as u32)[0])
}

/// Bilinear sample with edge clamping inside a half-pixel border.
pub(crate) fn sample_bilinear(img: &GrayImage, x: f64, y: f64) -> Option<u8> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || x < -0.5 || y < -0.5 || x > w as f64 - 0.5 || y > h as f64 - 0.5 {
        return None;
    }
    let x = x.clamp(0.0, (w - 1) as f64);
    let y = y.clamp(0.0, (h - 1) as f64);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p = |xx: u32, yy: u32| img.get_pixel(xx, yy)[0] as f64;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    Some((top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8)
}
