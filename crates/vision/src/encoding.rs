//! Still-image compression of raw BGR views.

use std::fmt;

use bytes::Bytes;
use image::{
    ExtendedColorType, ImageEncoder,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
};
use serde::Serialize;
use thiserror::Error;
use video_ingest::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EncodeFormat {
    Jpeg,
    Png,
}

impl EncodeFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            EncodeFormat::Jpeg => "jpeg",
            EncodeFormat::Png => "png",
        }
    }

    pub const fn content_type(self) -> &'static str {
        match self {
            EncodeFormat::Jpeg => "image/jpeg",
            EncodeFormat::Png => "image/png",
        }
    }
}

impl fmt::Display for EncodeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format plus JPEG quality (1-100, ignored for PNG).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeSettings {
    pub format: EncodeFormat,
    pub quality: u8,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            format: EncodeFormat::Jpeg,
            quality: 85,
        }
    }
}

/// Encoded image tagged with the pipeline tick that produced it.
///
/// `sequence` only orders buffers within one channel so stale results can be
/// recognised; consumers get no delivery guarantee from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedBuffer {
    pub data: Bytes,
    pub sequence: u64,
    pub format: EncodeFormat,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cannot encode an empty frame")]
    EmptyFrame,
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Compress a BGR frame into the configured format.
pub fn encode_frame(frame: &Frame, settings: &EncodeSettings) -> Result<Vec<u8>, EncodeError> {
    if frame.is_empty() {
        return Err(EncodeError::EmptyFrame);
    }
    let expected = frame.stride() * frame.height as usize;
    if frame.data.len() != expected {
        return Err(EncodeError::BufferSize {
            expected,
            actual: frame.data.len(),
        });
    }

    let mut rgb = frame.data.clone();
    for px in rgb.chunks_exact_mut(3) {
        px.swap(0, 2);
    }

    let mut out = Vec::with_capacity(expected / 8);
    match settings.format {
        EncodeFormat::Jpeg => {
            let quality = settings.quality.clamp(1, 100);
            JpegEncoder::new_with_quality(&mut out, quality).write_image(
                &rgb,
                frame.width,
                frame.height,
                ExtendedColorType::Rgb8,
            )?;
        }
        EncodeFormat::Png => {
            PngEncoder::new(&mut out).write_image(
                &rgb,
                frame.width,
                frame.height,
                ExtendedColorType::Rgb8,
            )?;
        }
    }
    Ok(out)
}
