//! Foreground segmentation boundary.
//!
//! The pipeline never segments on its own: it hands the raw photo to a
//! [`SegmentationProvider`] and gets a [`ForegroundMask`] back. Three providers ship
//! with the crate:
//!
//! - [`HttpSegmentation`] posts the photo as PNG to a background-removal service and
//!   reads the cut-out (alpha = foreground) or a plain mask image back.
//! - [`OtsuSegmentation`] thresholds luminance locally; good enough for a bright
//!   filament on a dark bed.
//! - [`PrecomputedMask`] returns a mask produced earlier (e.g. a stored cut-out).

use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::RawImage;
use crate::mask::ForegroundMask;

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("service returned HTTP {0}")]
    Status(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("mask is {got:?}, photo is {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },

    #[error("not configured: {0}")]
    NotConfigured(String),
}

/// Produces a foreground mask for a photo.
pub trait SegmentationProvider {
    fn segment(&self, image: &RawImage) -> Result<ForegroundMask, SegmentationError>;

    /// Short name recorded in run reports.
    fn name(&self) -> &str;
}

/// Segmentation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegmentationConfig {
    /// Per-request timeout in seconds.
    pub timeout_s: f64,
    /// Extra attempts after a failed request. Clamped to 1.
    pub max_retries: u32,
    /// Service URL for [`HttpSegmentation`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Environment variable holding the service API key.
    pub api_key_env: String,
    /// Largest accepted response body.
    pub max_response_bytes: u64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            timeout_s: 120.0,
            max_retries: 0,
            endpoint: None,
            api_key_env: "PACAM_SEGMENT_KEY".to_string(),
            max_response_bytes: 64 * 1024 * 1024,
        }
    }
}

impl SegmentationConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.timeout_s.is_finite() || self.timeout_s <= 0.0 {
            return Err("segmentation.timeout_s must be > 0".to_string());
        }
        if self.max_response_bytes == 0 {
            return Err("segmentation.max_response_bytes must be > 0".to_string());
        }
        Ok(())
    }

    /// Retries actually performed by the orchestrator.
    pub fn effective_retries(&self) -> u32 {
        self.max_retries.min(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }
}

/// Remote background-removal service.
pub struct HttpSegmentation {
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
    max_response_bytes: u64,
    agent: ureq::Agent,
}

impl HttpSegmentation {
    /// Build a client from config; the API key is read from `api_key_env` if set.
    pub fn from_config(config: &SegmentationConfig) -> Result<Self, SegmentationError> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            SegmentationError::NotConfigured("segmentation.endpoint is not set".to_string())
        })?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            tracing::debug!("{} not set; sending unauthenticated requests", config.api_key_env);
        }
        Ok(Self::new(endpoint, api_key, config))
    }

    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        config: &SegmentationConfig,
    ) -> Self {
        let timeout = config.timeout();
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            endpoint: endpoint.into(),
            api_key,
            timeout,
            max_response_bytes: config.max_response_bytes,
            agent,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_error(&self, err: ureq::Error) -> SegmentationError {
        match err {
            ureq::Error::Timeout(_) => SegmentationError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            },
            ureq::Error::StatusCode(code) => SegmentationError::Status(code),
            other => SegmentationError::Transport(other.to_string()),
        }
    }
}

impl SegmentationProvider for HttpSegmentation {
    fn segment(&self, photo: &RawImage) -> Result<ForegroundMask, SegmentationError> {
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(photo.pixels().clone())
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| SegmentationError::Transport(format!("encode request: {e}")))?;

        let mut request = self
            .agent
            .post(&self.endpoint)
            .header("Content-Type", "image/png")
            .header("Accept", "image/png");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Key {key}"));
        }

        tracing::debug!("POST {} ({} bytes)", self.endpoint, png.len());
        let response = request.send(&png[..]).map_err(|e| self.map_error(e))?;
        let body = response
            .into_body()
            .with_config()
            .limit(self.max_response_bytes)
            .read_to_vec()
            .map_err(|e| self.map_error(e))?;

        let decoded = image::load_from_memory(&body)
            .map_err(|e| SegmentationError::InvalidResponse(format!("decode mask: {e}")))?;
        Ok(ForegroundMask::from_dynamic(&decoded))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Local global-threshold segmentation (Otsu on luminance).
#[derive(Debug, Clone, Copy, Default)]
pub struct OtsuSegmentation {
    /// Treat darker-than-threshold pixels as foreground.
    pub dark_foreground: bool,
}

impl SegmentationProvider for OtsuSegmentation {
    fn segment(&self, photo: &RawImage) -> Result<ForegroundMask, SegmentationError> {
        let mut gray = DynamicImage::ImageRgb8(photo.pixels().clone()).to_luma8();
        if self.dark_foreground {
            image::imageops::invert(&mut gray);
        }
        let level = imageproc::contrast::otsu_level(&gray);
        tracing::debug!("Otsu level {level}");
        Ok(ForegroundMask::from_luma(&gray, level))
    }

    fn name(&self) -> &str {
        "otsu"
    }
}

/// A mask computed ahead of time.
#[derive(Debug, Clone)]
pub struct PrecomputedMask {
    mask: ForegroundMask,
}

impl PrecomputedMask {
    pub fn new(mask: ForegroundMask) -> Self {
        Self { mask }
    }

    /// Load a cut-out or mask image; see [`ForegroundMask::from_dynamic`].
    pub fn from_path(path: &Path) -> Result<Self, SegmentationError> {
        let img = image::open(path).map_err(|e| {
            SegmentationError::InvalidResponse(format!("failed to read {}: {e}", path.display()))
        })?;
        Ok(Self::new(ForegroundMask::from_dynamic(&img)))
    }
}

impl SegmentationProvider for PrecomputedMask {
    fn segment(&self, _photo: &RawImage) -> Result<ForegroundMask, SegmentationError> {
        Ok(self.mask.clone())
    }

    fn name(&self) -> &str {
        "precomputed"
    }
}
