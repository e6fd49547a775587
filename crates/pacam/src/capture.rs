//! Photo acquisition boundary.
//!
//! The core asks a [`CaptureSource`] for exactly one frame per run and never retries:
//! a failed capture is a precondition violation reported as
//! [`CalibrationError::Capture`].

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use image::{imageops, DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};
use crate::pattern::CameraPlacement;

/// Upper bound on a snapshot download.
const MAX_SNAPSHOT_BYTES: u64 = 64 * 1024 * 1024;

/// Fixed orientation correction applied right after decoding a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureOrientation {
    #[default]
    AsIs,
    /// Flip both axes, then rotate 90° counter-clockwise (a camera mounted upside down
    /// and sideways on the toolhead).
    Rotate180ThenCcw90,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl CaptureOrientation {
    pub fn apply(self, img: RgbImage) -> RgbImage {
        match self {
            Self::AsIs => img,
            Self::Rotate180ThenCcw90 => imageops::rotate270(&imageops::rotate180(&img)),
            Self::Rotate90 => imageops::rotate90(&img),
            Self::Rotate180 => imageops::rotate180(&img),
            Self::Rotate270 => imageops::rotate270(&img),
        }
    }
}

/// Capture adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub orientation: CaptureOrientation,
    /// Timeout for HTTP snapshot requests in seconds.
    pub snapshot_timeout_s: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            orientation: CaptureOrientation::AsIs,
            snapshot_timeout_s: 2.0,
        }
    }
}

/// Metadata recorded alongside a captured frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub width: u32,
    pub height: u32,
    pub camera: CameraPlacement,
    pub captured_at_unix_ms: u64,
    /// Where the frame came from (file path or URL), for the run report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// One photograph of the printed pattern.
///
/// Owned by the orchestrator for the whole run and never modified; later stages build
/// new buffers from it.
#[derive(Debug, Clone)]
pub struct RawImage {
    pixels: RgbImage,
    meta: CaptureMetadata,
}

impl RawImage {
    pub fn new(pixels: RgbImage, camera: CameraPlacement, captured_at_unix_ms: u64) -> Self {
        let meta = CaptureMetadata {
            width: pixels.width(),
            height: pixels.height(),
            camera,
            captured_at_unix_ms,
            source: None,
        };
        Self { pixels, meta }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = Some(source.into());
        self
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn metadata(&self) -> &CaptureMetadata {
        &self.meta
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }
}

/// Supplies one frame per request.
pub trait CaptureSource {
    fn capture(&self) -> Result<RawImage>;
}

/// Reads a stored photo from disk.
#[derive(Debug, Clone)]
pub struct FileCapture {
    path: PathBuf,
    camera: CameraPlacement,
    orientation: CaptureOrientation,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>, camera: CameraPlacement) -> Self {
        Self {
            path: path.into(),
            camera,
            orientation: CaptureOrientation::AsIs,
        }
    }

    pub fn with_orientation(mut self, orientation: CaptureOrientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureSource for FileCapture {
    fn capture(&self) -> Result<RawImage> {
        let img = image::open(&self.path).map_err(|e| {
            CalibrationError::Capture(format!("failed to open {}: {e}", self.path.display()))
        })?;
        let captured_at = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map(unix_ms)
            .unwrap_or_else(|_| unix_ms(SystemTime::now()));
        let pixels = self.orientation.apply(img.to_rgb8());
        tracing::debug!(
            "Loaded capture {} ({}x{})",
            self.path.display(),
            pixels.width(),
            pixels.height()
        );
        Ok(RawImage::new(pixels, self.camera, captured_at)
            .with_source(self.path.display().to_string()))
    }
}

/// Fetches a JPEG/PNG snapshot over HTTP (e.g. a webcam streamer's snapshot URL).
pub struct HttpSnapshotCapture {
    url: String,
    camera: CameraPlacement,
    orientation: CaptureOrientation,
    agent: ureq::Agent,
}

impl HttpSnapshotCapture {
    pub fn new(url: impl Into<String>, camera: CameraPlacement, config: &CaptureConfig) -> Self {
        let timeout = Duration::from_secs_f64(config.snapshot_timeout_s.max(0.001));
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            url: url.into(),
            camera,
            orientation: config.orientation,
            agent,
        }
    }
}

impl CaptureSource for HttpSnapshotCapture {
    fn capture(&self) -> Result<RawImage> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|e| CalibrationError::Capture(format!("snapshot {}: {e}", self.url)))?;
        let bytes = response
            .into_body()
            .with_config()
            .limit(MAX_SNAPSHOT_BYTES)
            .read_to_vec()
            .map_err(|e| CalibrationError::Capture(format!("snapshot body: {e}")))?;
        let img = image::load_from_memory(&bytes)
            .map_err(|e| CalibrationError::Capture(format!("snapshot decode: {e}")))?;
        let pixels = self.orientation.apply(img.to_rgb8());
        Ok(RawImage::new(pixels, self.camera, unix_ms(SystemTime::now())).with_source(&*self.url))
    }
}

/// Wraps an in-memory frame; used by tests and callers that capture elsewhere.
#[derive(Debug, Clone)]
pub struct FrameCapture(pub RawImage);

impl CaptureSource for FrameCapture {
    fn capture(&self) -> Result<RawImage> {
        Ok(self.0.clone())
    }
}

impl From<DynamicImage> for FrameCapture {
    fn from(img: DynamicImage) -> Self {
        Self(RawImage::new(
            img.to_rgb8(),
            CameraPlacement::default(),
            unix_ms(SystemTime::now()),
        ))
    }
}

pub(crate) fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn marked(w: u32, h: u32) -> RgbImage {
        let mut img = RgbImage::new(w, h);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img
    }

    #[test]
    fn upside_down_sideways_mount_is_corrected() {
        let out = CaptureOrientation::Rotate180ThenCcw90.apply(marked(4, 2));
        assert_eq!(out.dimensions(), (2, 4));
        // (0,0) -> flip both -> (3,1) -> ccw 90 -> (1, 0).
        assert_eq!(out.get_pixel(1, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn metadata_tracks_resolution() {
        let raw = RawImage::new(marked(8, 6), CameraPlacement::default(), 1_700_000_000_000)
            .with_source("frame.jpg");
        assert_eq!(raw.metadata().width, 8);
        assert_eq!(raw.metadata().height, 6);
        assert_eq!(raw.metadata().source.as_deref(), Some("frame.jpg"));
        assert_eq!(raw.dimensions(), (8, 6));
    }

    #[test]
    fn missing_file_is_capture_error() {
        let cap = FileCapture::new("/nonexistent/pacam/frame.jpg", CameraPlacement::default());
        let err = cap.capture().unwrap_err();
        assert!(matches!(err, CalibrationError::Capture(_)));
    }
}
