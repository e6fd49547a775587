//! Binary foreground masks and the morphology used on them.

use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbaImage};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{connected_components, Connectivity};

pub(crate) const FOREGROUND: u8 = 255;
pub(crate) const BACKGROUND: u8 = 0;

/// Gray levels above this count as foreground when a mask arrives as plain luma.
const LUMA_THRESHOLD: u8 = 127;

/// Binary buffer (0 = background, 255 = foreground) matching the raw photo's size.
#[derive(Debug, Clone, PartialEq)]
pub struct ForegroundMask {
    pixels: GrayImage,
}

impl ForegroundMask {
    /// Binarize a grayscale image: values `> threshold` become foreground.
    pub fn from_luma(gray: &GrayImage, threshold: u8) -> Self {
        let mut pixels = gray.clone();
        binarize_in_place(&mut pixels, threshold);
        Self { pixels }
    }

    /// Foreground is every pixel with non-zero alpha, as in background-removal cut-outs.
    pub fn from_alpha(rgba: &RgbaImage) -> Self {
        let pixels = GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
            Luma([if rgba.get_pixel(x, y)[3] > 0 {
                FOREGROUND
            } else {
                BACKGROUND
            }])
        });
        Self { pixels }
    }

    /// Alpha when the image has one, otherwise luma `> 127`.
    pub fn from_dynamic(img: &DynamicImage) -> Self {
        if img.color().has_alpha() {
            Self::from_alpha(&img.to_rgba8())
        } else {
            Self::from_luma(&img.to_luma8(), LUMA_THRESHOLD)
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        self.pixels.get_pixel(x, y)[0] == FOREGROUND
    }

    /// Number of foreground pixels.
    pub fn count(&self) -> usize {
        self.pixels.pixels().filter(|p| p[0] == FOREGROUND).count()
    }

    pub fn as_image(&self) -> &GrayImage {
        &self.pixels
    }

    /// Opening then closing with an L∞ (square) structuring element of `radius`.
    ///
    /// Opening strips thin strands and speckle; closing fills pinholes in the outline.
    pub fn cleaned(&self, radius: u8, open_iterations: usize, close_iterations: usize) -> GrayImage {
        let mut out = self.pixels.clone();
        if radius == 0 {
            return out;
        }
        for _ in 0..open_iterations {
            out = imageproc::morphology::open(&out, Norm::LInf, radius);
        }
        for _ in 0..close_iterations {
            out = imageproc::morphology::close(&out, Norm::LInf, radius);
        }
        out
    }
}

pub(crate) fn binarize_in_place(img: &mut GrayImage, threshold: u8) {
    for p in img.pixels_mut() {
        p[0] = if p[0] > threshold {
            FOREGROUND
        } else {
            BACKGROUND
        };
    }
}

/// Drop 8-connected foreground components with fewer than `min_area` pixels.
pub(crate) fn remove_small_components(mask: &GrayImage, min_area: usize) -> GrayImage {
    if min_area <= 1 {
        return mask.clone();
    }
    let labels = connected_components(mask, Connectivity::Eight, Luma([BACKGROUND]));
    let n_labels = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    let mut areas = vec![0usize; n_labels + 1];
    for p in labels.pixels() {
        areas[p[0] as usize] += 1;
    }

    let mut out = mask.clone();
    for (x, y, p) in out.enumerate_pixels_mut() {
        let label = labels.get_pixel(x, y)[0] as usize;
        if label != 0 && areas[label] < min_area {
            p[0] = BACKGROUND;
        }
    }
    out
}

/// Fraction of foreground pixels in `img`, used for diagnostics.
pub(crate) fn coverage<I: GenericImageView<Pixel = Luma<u8>>>(img: &I) -> f64 {
    let (w, h) = img.dimensions();
    let total = w as usize * h as usize;
    if total == 0 {
        return 0.0;
    }
    let fg = img.pixels().filter(|(_, _, p)| p[0] == FOREGROUND).count();
    fg as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn alpha_defines_foreground() {
        let mut rgba = RgbaImage::new(4, 2);
        rgba.put_pixel(1, 0, Rgba([0, 0, 0, 1]));
        rgba.put_pixel(3, 1, Rgba([200, 10, 10, 255]));
        let mask = ForegroundMask::from_dynamic(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(mask.count(), 2);
        assert!(mask.is_foreground(1, 0));
        assert!(!mask.is_foreground(0, 0));
    }

    #[test]
    fn luma_is_thresholded() {
        let gray = GrayImage::from_fn(3, 1, |x, _| Luma([[10, 128, 250][x as usize]]));
        let mask = ForegroundMask::from_dynamic(&DynamicImage::ImageLuma8(gray));
        assert_eq!(mask.as_image().as_raw(), &vec![0, 255, 255]);
    }

    #[test]
    fn opening_removes_speckle_but_keeps_blocks() {
        let mut gray = GrayImage::new(60, 60);
        for y in 10..40 {
            for x in 10..40 {
                gray.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
        gray.put_pixel(52, 52, Luma([FOREGROUND]));
        let mask = ForegroundMask::from_luma(&gray, 127);
        let cleaned = mask.cleaned(2, 1, 1);
        assert_eq!(cleaned.get_pixel(52, 52)[0], BACKGROUND);
        assert_eq!(cleaned.get_pixel(25, 25)[0], FOREGROUND);
        assert_eq!(cleaned.get_pixel(10, 10)[0], FOREGROUND);
    }

    #[test]
    fn small_components_are_dropped() {
        let mut gray = GrayImage::new(30, 10);
        for x in 0..20 {
            gray.put_pixel(x, 5, Luma([FOREGROUND]));
        }
        gray.put_pixel(27, 2, Luma([FOREGROUND]));
        gray.put_pixel(28, 2, Luma([FOREGROUND]));
        let out = remove_small_components(&gray, 5);
        assert_eq!(out.get_pixel(27, 2)[0], BACKGROUND);
        assert_eq!(out.get_pixel(10, 5)[0], FOREGROUND);
        assert!((coverage(&out) - 20.0 / 300.0).abs() < 1e-12);
    }
}
