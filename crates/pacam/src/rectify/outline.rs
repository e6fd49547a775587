//! Locating the printed outline rectangle in a foreground mask.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::{approximate_polygon_dp, arc_length, min_area_rect};
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

use super::RectifyConfig;
use crate::error::{CalibrationError, Result};
use crate::pixelmap::PixelMapper;

/// Fewer undistortable contour points than this cannot describe an outline.
const MIN_OUTLINE_POINTS: usize = 8;
/// Fewest points a side line is refitted from.
const MIN_SIDE_POINTS: usize = 5;
/// Only the middle of each side is used; the ends are rounded by cleaning.
const SIDE_TRIM: f64 = 0.1;
/// Inlier distances for successive side refits; the first is raised to 5 % of the side.
const SIDE_TOLERANCES_PX: [f64; 3] = [4.0, 3.0, 2.0];
/// Contour points are boundary pixel centres; the blob edge is this far outside them.
const PIXEL_EDGE_OFFSET: f64 = 0.5;

/// How the four corners were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuadSource {
    /// Douglas-Peucker simplification at `epsilon_scale × perimeter`.
    Polygon { epsilon_scale: f64 },
    /// Minimal-area enclosing rectangle of the contour.
    MinAreaRect,
}

/// Outline quadrilateral. Corners run top-left, top-right, bottom-right, bottom-left.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OutlineQuad {
    /// Corners in raw (distorted) continuous pixel coordinates.
    pub corners: [[f64; 2]; 4],
    /// The same corners in undistorted working pixels.
    pub undistorted: [[f64; 2]; 4],
    pub contour_area_px: f64,
    pub source: QuadSource,
    /// Corners come from intersecting refitted side lines.
    pub refined: bool,
}

/// Largest external contour of plausible size, fitted with a quadrilateral.
///
/// The contour is undistorted through `mapper` before fitting, so the four sides are
/// straight lines in working space even when the lens bends them in the photo.
pub(crate) fn find_outline(
    cleaned: &GrayImage,
    config: &RectifyConfig,
    mapper: &dyn PixelMapper,
) -> Result<OutlineQuad> {
    let (w, h) = cleaned.dimensions();
    let min_area = config
        .min_contour_area_px
        .max(config.min_area_fraction * w as f64 * h as f64);

    let contours = find_contours::<i32>(cleaned);
    let n_external = contours
        .iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .count();

    let (points, area) = contours
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| {
            let area = polygon_area(&c.points);
            (c.points, area)
        })
        .filter(|(_, area)| *area >= min_area)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .ok_or_else(|| {
            CalibrationError::PatternNotFound(format!(
                "no external contour with area >= {min_area:.0} px² ({n_external} candidates)"
            ))
        })?;

    tracing::debug!(
        "Outline contour: {} points, area {:.0} px² ({} external contours)",
        points.len(),
        area,
        n_external
    );

    let working: Vec<[f64; 2]> = points
        .iter()
        .filter_map(|p| mapper.image_to_working_pixel([p.x as f64 + 0.5, p.y as f64 + 0.5]))
        .collect();
    if working.len() < MIN_OUTLINE_POINTS {
        return Err(CalibrationError::PatternNotFound(format!(
            "only {} of {} outline points inside the lens model domain",
            working.len(),
            points.len()
        )));
    }
    let snapped: Vec<Point<i32>> = working
        .iter()
        .map(|p| Point::new(p[0].floor() as i32, p[1].floor() as i32))
        .collect();

    let (quad, source) = fit_quad(&snapped, &config.polygon_epsilon_scales);
    let initial = order_corners(quad.map(|p| [p[0] + 0.5, p[1] + 0.5]));
    let refined = refine_corners(&working, initial, PIXEL_EDGE_OFFSET);
    let undistorted = refined.unwrap_or_else(|| expand_to_pixel_edges(order_corners(quad)));
    tracing::debug!(
        "Outline quad from {:?}, side refinement {}",
        source,
        if refined.is_some() { "applied" } else { "skipped" }
    );

    let mut corners = [[0.0; 2]; 4];
    for (dst, src) in corners.iter_mut().zip(&undistorted) {
        *dst = mapper.working_to_image_pixel(*src).ok_or_else(|| {
            CalibrationError::PatternNotFound(format!(
                "corner ({:.1}, {:.1}) outside lens model domain",
                src[0], src[1]
            ))
        })?;
    }

    Ok(OutlineQuad {
        corners,
        undistorted,
        contour_area_px: area,
        source,
        refined: refined.is_some(),
    })
}

/// Line `normal · p = offset` with a unit normal.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Line {
    normal: [f64; 2],
    offset: f64,
}

impl Line {
    fn through(a: [f64; 2], b: [f64; 2]) -> Option<Self> {
        let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
        let len = dx.hypot(dy);
        if len < 1e-9 {
            return None;
        }
        let normal = [-dy / len, dx / len];
        Some(Self {
            normal,
            offset: normal[0] * a[0] + normal[1] * a[1],
        })
    }

    /// Total-least-squares fit.
    fn fit(points: &[[f64; 2]]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f64;
        let mx = points.iter().map(|p| p[0]).sum::<f64>() / n;
        let my = points.iter().map(|p| p[1]).sum::<f64>() / n;
        let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
        for p in points {
            let (dx, dy) = (p[0] - mx, p[1] - my);
            sxx += dx * dx;
            syy += dy * dy;
            sxy += dx * dy;
        }
        if sxx + syy < 1e-12 {
            return None;
        }
        let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
        let normal = [-theta.sin(), theta.cos()];
        Some(Self {
            normal,
            offset: normal[0] * mx + normal[1] * my,
        })
    }

    fn signed_distance(&self, p: [f64; 2]) -> f64 {
        self.normal[0] * p[0] + self.normal[1] * p[1] - self.offset
    }

    fn intersect(&self, other: &Self) -> Option<[f64; 2]> {
        let [a, b] = self.normal;
        let [c, d] = other.normal;
        let det = a * d - b * c;
        if det.abs() < 1e-9 {
            return None;
        }
        Some([
            (self.offset * d - other.offset * b) / det,
            (a * other.offset - c * self.offset) / det,
        ])
    }
}

/// Refit each side of `initial` to the contour points along its middle and intersect
/// neighbouring sides. Every side is pushed `outward` away from the quad centre.
///
/// Returns `None` when a side is degenerate or a refined corner strays further than a
/// quarter of the shortest side from its initial position.
pub(crate) fn refine_corners(
    points: &[[f64; 2]],
    initial: [[f64; 2]; 4],
    outward: f64,
) -> Option<[[f64; 2]; 4]> {
    let c = centroid(&initial);
    let mut lines = [Line {
        normal: [0.0, 0.0],
        offset: 0.0,
    }; 4];
    let mut shortest = f64::INFINITY;

    for (i, slot) in lines.iter_mut().enumerate() {
        let a = initial[i];
        let b = initial[(i + 1) % 4];
        let len = (b[0] - a[0]).hypot(b[1] - a[1]);
        shortest = shortest.min(len);
        let mut line = Line::through(a, b)?;
        let dir = [(b[0] - a[0]) / len, (b[1] - a[1]) / len];

        let span: Vec<[f64; 2]> = points
            .iter()
            .copied()
            .filter(|p| {
                let t = (p[0] - a[0]) * dir[0] + (p[1] - a[1]) * dir[1];
                t >= SIDE_TRIM * len && t <= (1.0 - SIDE_TRIM) * len
            })
            .collect();

        for (k, &tol) in SIDE_TOLERANCES_PX.iter().enumerate() {
            let tol = if k == 0 { tol.max(0.05 * len) } else { tol };
            let inliers: Vec<[f64; 2]> = span
                .iter()
                .copied()
                .filter(|p| line.signed_distance(*p).abs() <= tol)
                .collect();
            if inliers.len() < MIN_SIDE_POINTS {
                break;
            }
            match Line::fit(&inliers) {
                Some(fitted) => line = fitted,
                None => break,
            }
        }

        line.offset -= outward * line.signed_distance(c).signum();
        *slot = line;
    }

    let mut corners = [[0.0; 2]; 4];
    for (i, corner) in corners.iter_mut().enumerate() {
        *corner = lines[(i + 3) % 4].intersect(&lines[i])?;
    }
    let limit = 0.25 * shortest;
    let within = corners.iter().zip(&initial).all(|(p, q)| {
        p[0].is_finite() && p[1].is_finite() && (p[0] - q[0]).hypot(p[1] - q[1]) <= limit
    });
    within.then(|| order_corners(corners))
}

/// Shoelace area of a closed polygon.
pub(crate) fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();
    (twice as f64).abs() / 2.0
}

fn fit_quad(points: &[Point<i32>], epsilon_scales: &[f64]) -> ([[f64; 2]; 4], QuadSource) {
    let perimeter = arc_length(points, true);
    if perimeter > 0.0 {
        for &scale in epsilon_scales.iter().filter(|s| **s > 0.0) {
            let mut poly = approximate_polygon_dp(points, scale * perimeter, true);
            poly.dedup();
            if poly.len() > 1 && poly.first() == poly.last() {
                poly.pop();
            }
            if let [a, b, c, d] = poly.as_slice() {
                return (
                    [a, b, c, d].map(|p| [p.x as f64, p.y as f64]),
                    QuadSource::Polygon {
                        epsilon_scale: scale,
                    },
                );
            }
        }
    }
    let rect = min_area_rect(points);
    (
        rect.map(|p| [p.x as f64, p.y as f64]),
        QuadSource::MinAreaRect,
    )
}

/// Sort corners by angle around their centroid: top-left, top-right, bottom-right,
/// bottom-left for an upright quad (y grows downwards).
pub(crate) fn order_corners(corners: [[f64; 2]; 4]) -> [[f64; 2]; 4] {
    let c = centroid(&corners);
    let mut sorted = corners;
    sorted.sort_by(|a, b| {
        let ta = (a[1] - c[1]).atan2(a[0] - c[0]);
        let tb = (b[1] - c[1]).atan2(b[0] - c[0]);
        ta.total_cmp(&tb)
    });
    sorted
}

/// Contour points are pixel indices on the blob's boundary; push each corner half a
/// pixel outward to land on the blob's outer edge in continuous coordinates.
fn expand_to_pixel_edges(corners: [[f64; 2]; 4]) -> [[f64; 2]; 4] {
    let c = centroid(&corners);
    corners.map(|p| {
        [
            p[0] + 0.5 + 0.5 * (p[0] - c[0]).signum(),
            p[1] + 0.5 + 0.5 * (p[1] - c[1]).signum(),
        ]
    })
}

pub(crate) fn centroid(corners: &[[f64; 2]; 4]) -> [f64; 2] {
    let sx: f64 = corners.iter().map(|p| p[0]).sum();
    let sy: f64 = corners.iter().map(|p| p[1]).sum();
    [sx / 4.0, sy / 4.0]
}

/// Largest deviation from 90° over the four interior angles, in degrees.
pub(crate) fn max_corner_deviation_deg(corners: &[[f64; 2]; 4]) -> f64 {
    (0..4)
        .map(|i| {
            let prev = corners[(i + 3) % 4];
            let cur = corners[i];
            let next = corners[(i + 1) % 4];
            let a = [prev[0] - cur[0], prev[1] - cur[1]];
            let b = [next[0] - cur[0], next[1] - cur[1]];
            let norm = a[0].hypot(a[1]) * b[0].hypot(b[1]);
            if norm < 1e-12 {
                return 90.0;
            }
            let cos = ((a[0] * b[0] + a[1] * b[1]) / norm).clamp(-1.0, 1.0);
            (cos.acos().to_degrees() - 90.0).abs()
        })
        .fold(0.0, f64::max)
}

/// Mean lengths of the (top, bottom) and (left, right) side pairs.
pub(crate) fn side_lengths(corners: &[[f64; 2]; 4]) -> (f64, f64) {
    let len = |a: [f64; 2], b: [f64; 2]| (a[0] - b[0]).hypot(a[1] - b[1]);
    let [tl, tr, br, bl] = *corners;
    let horizontal = 0.5 * (len(tl, tr) + len(bl, br));
    let vertical = 0.5 * (len(tl, bl) + len(tr, br));
    (horizontal, vertical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::FOREGROUND;
    use crate::pixelmap::{LensDistortion, LensMapper};
    use approx::assert_abs_diff_eq;
    use image::Luma;

    fn filled_quad(w: u32, h: u32, quad: [[f64; 2]; 4]) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let p = [x as f64 + 0.5, y as f64 + 0.5];
            let inside = (0..4).all(|i| {
                let a = quad[i];
                let b = quad[(i + 1) % 4];
                (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0]) >= 0.0
            });
            Luma([if inside { FOREGROUND } else { 0 }])
        })
    }

    #[test]
    fn orders_corners_clockwise_from_top_left() {
        let shuffled = [[90.0, 80.0], [10.0, 12.0], [12.0, 75.0], [95.0, 8.0]];
        let ordered = order_corners(shuffled);
        assert_eq!(
            ordered,
            [[10.0, 12.0], [95.0, 8.0], [90.0, 80.0], [12.0, 75.0]]
        );
    }

    #[test]
    fn finds_tilted_quad() {
        let quad = [[40.0, 30.0], [170.0, 45.0], [160.0, 120.0], [30.0, 100.0]];
        let img = filled_quad(200, 150, quad);
        let outline = find_outline(&img, &RectifyConfig::default(), &LensMapper::Identity).unwrap();
        assert!(outline.refined);
        assert_eq!(outline.corners, outline.undistorted);
        for (got, want) in outline.corners.iter().zip(&quad) {
            assert_abs_diff_eq!(got[0], want[0], epsilon = 1.5);
            assert_abs_diff_eq!(got[1], want[1], epsilon = 1.5);
        }
        assert!(max_corner_deviation_deg(&outline.corners) < 20.0);
    }

    #[test]
    fn small_blobs_are_not_outlines() {
        let img = filled_quad(200, 150, [[10.0, 10.0], [30.0, 10.0], [30.0, 30.0], [10.0, 30.0]]);
        let err = find_outline(&img, &RectifyConfig::default(), &LensMapper::Identity).unwrap_err();
        assert!(matches!(err, CalibrationError::PatternNotFound(_)));

        let empty = GrayImage::new(64, 64);
        assert!(find_outline(&empty, &RectifyConfig::default(), &LensMapper::Identity).is_err());
    }

    #[test]
    fn side_refit_recovers_misplaced_corner() {
        // Boundary pixel centres of a 200x100 blob at the origin.
        let mut points = Vec::new();
        for x in 0..200 {
            points.push([x as f64 + 0.5, 0.5]);
            points.push([x as f64 + 0.5, 99.5]);
        }
        for y in 1..99 {
            points.push([0.5, y as f64 + 0.5]);
            points.push([199.5, y as f64 + 0.5]);
        }
        // Top-left slid 20 px along the top edge.
        let initial = [[20.5, 0.5], [199.5, 0.5], [199.5, 99.5], [0.5, 99.5]];

        let refined = refine_corners(&points, initial, 0.5).unwrap();
        let expected = [[0.0, 0.0], [200.0, 0.0], [200.0, 100.0], [0.0, 100.0]];
        for (got, want) in refined.iter().zip(&expected) {
            assert_abs_diff_eq!(got[0], want[0], epsilon = 1e-6);
            assert_abs_diff_eq!(got[1], want[1], epsilon = 1e-6);
        }
    }

    #[test]
    fn side_refit_rejects_degenerate_quads() {
        let points: Vec<[f64; 2]> = (0..50).map(|x| [x as f64, 0.0]).collect();
        let collapsed = [[0.0, 0.0], [10.0, 0.0], [10.0, 0.0], [0.0, 0.0]];
        assert_eq!(refine_corners(&points, collapsed, 0.5), None);
    }

    #[test]
    fn barrel_distorted_outline_is_fitted_in_working_space() {
        let mapper = LensDistortion::Division {
            lambda: -4e-6,
            center: None,
        }
        .mapper(200, 150);
        let quad = [[30.0, 25.0], [170.0, 25.0], [170.0, 125.0], [30.0, 125.0]];
        // Rasterise the rectangle as the distorting lens would record it.
        let img = GrayImage::from_fn(200, 150, |x, y| {
            let inside = mapper
                .image_to_working_pixel([x as f64 + 0.5, y as f64 + 0.5])
                .is_some_and(|p| p[0] >= 30.0 && p[0] < 170.0 && p[1] >= 25.0 && p[1] < 125.0);
            Luma([if inside { FOREGROUND } else { 0 }])
        });

        let outline = find_outline(&img, &RectifyConfig::default(), &mapper).unwrap();
        for (got, want) in outline.undistorted.iter().zip(&quad) {
            assert_abs_diff_eq!(got[0], want[0], epsilon = 1.0);
            assert_abs_diff_eq!(got[1], want[1], epsilon = 1.0);
        }
        for (raw, working) in outline.corners.iter().zip(&outline.undistorted) {
            let back = mapper.image_to_working_pixel(*raw).unwrap();
            assert_abs_diff_eq!(back[0], working[0], epsilon = 1e-6);
            assert_abs_diff_eq!(back[1], working[1], epsilon = 1e-6);
        }
    }

    #[test]
    fn shoelace_area_of_rectangle() {
        let pts = [
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 4),
            Point::new(0, 4),
        ];
        assert_abs_diff_eq!(polygon_area(&pts), 40.0);
    }

    #[test]
    fn deviation_and_sides() {
        let rect = [[0.0, 0.0], [8.0, 0.0], [8.0, 2.0], [0.0, 2.0]];
        assert_abs_diff_eq!(max_corner_deviation_deg(&rect), 0.0, epsilon = 1e-9);
        let (h, v) = side_lengths(&rect);
        assert_abs_diff_eq!(h, 8.0);
        assert_abs_diff_eq!(v, 2.0);

        let skewed = [[0.0, 0.0], [8.0, 0.0], [12.0, 4.0], [4.0, 4.0]];
        assert_abs_diff_eq!(max_corner_deviation_deg(&skewed), 45.0, epsilon = 1e-9);
    }
}
