//! Image transform applied to every accepted photo.

use crate::config::FilterConfig;
use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;

/// Errors that can occur while transforming a photo.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Empty image payload")]
    Empty,

    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),
}

/// A deterministic `bytes -> bytes` photo transform.
///
/// Implementations are CPU bound and are called from the blocking pool.
#[cfg_attr(test, mockall::automock)]
pub trait PhotoTransform: Send + Sync {
    fn apply(&self, raw: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// Brightens every channel by a constant factor and re-encodes as JPEG.
#[derive(Debug, Clone)]
pub struct BrightnessFilter {
    factor: f32,
    jpeg_quality: u8,
}

impl BrightnessFilter {
    pub fn new(factor: f32, jpeg_quality: u8) -> Self {
        Self {
            factor,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }
}

impl From<&FilterConfig> for BrightnessFilter {
    fn from(config: &FilterConfig) -> Self {
        Self::new(config.brightness, config.jpeg_quality)
    }
}

impl PhotoTransform for BrightnessFilter {
    fn apply(&self, raw: &[u8]) -> Result<Vec<u8>, TransformError> {
        if raw.is_empty() {
            return Err(TransformError::Empty);
        }

        let decoded = image::load_from_memory(raw).map_err(TransformError::Decode)?;
        let mut rgb = decoded.to_rgb8();
        for pixel in rgb.pixels_mut() {
            for channel in pixel.0.iter_mut() {
                *channel = scale_channel(*channel, self.factor);
            }
        }

        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, self.jpeg_quality)
            .encode_image(&rgb)
            .map_err(TransformError::Encode)?;

        Ok(encoded)
    }
}

fn scale_channel(value: u8, factor: f32) -> u8 {
    (value as f32 * factor).round().clamp(0.0, 255.0) as u8
}
