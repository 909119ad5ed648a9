use anyhow::Error;
use image::{ImageBuffer, Rgb, imageops::FilterType};
use thiserror::Error;

/// Raw 3-channel frame captured from a video source.
///
/// Pixels are tightly packed rows of `width * 3` bytes in the channel order
/// given by `format`.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub const fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("no frame available within the read timeout")]
    NoFrame,
    #[error("video source disconnected")]
    Disconnected,
    #[error(transparent)]
    Other(#[from] Error),
}

impl Frame {
    /// Build a BGR8 frame, checking the buffer length against the geometry.
    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32, timestamp_ms: i64) -> Result<Self, CaptureError> {
        let expected = (width as usize) * (height as usize) * FrameFormat::Bgr8.channels();
        if data.len() != expected {
            return Err(CaptureError::Other(anyhow::anyhow!(
                "unexpected frame buffer size: got {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        })
    }

    /// Black frame of the given geometry.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            data: vec![0; (width as usize) * (height as usize) * FrameFormat::Bgr8.channels()],
            width,
            height,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }
    }

    /// Zero-size frames are used as stop sentinels between pipeline stages.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.channels()
    }

    /// Return the pixel at `(x, y)` in the frame's native channel order.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = y as usize * self.stride() + x as usize * 3;
        [self.data[offset], self.data[offset + 1], self.data[offset + 2]]
    }

    /// Resize to `width`x`height` with bilinear filtering. Returns `self`
    /// untouched when the geometry already matches.
    pub fn resized(self, width: u32, height: u32) -> Result<Self, CaptureError> {
        if self.width == width && self.height == height {
            return Ok(self);
        }
        let Frame {
            data,
            width: src_w,
            height: src_h,
            timestamp_ms,
            format,
        } = self;
        let source = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(src_w, src_h, data)
            .ok_or_else(|| anyhow::anyhow!("frame buffer does not match {src_w}x{src_h}"))?;
        // Channel order is irrelevant to the filter, so BGR passes through as-is.
        let scaled = image::imageops::resize(&source, width, height, FilterType::Triangle);
        Ok(Self {
            data: scaled.into_raw(),
            width,
            height,
            timestamp_ms,
            format,
        })
    }
}
