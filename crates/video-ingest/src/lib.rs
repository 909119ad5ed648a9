//! Camera frame sources for the ROI streaming pipeline.
//!
//! Every backend decodes on its own thread as fast as the upstream stream
//! allows and keeps only the newest frame in a [`Mailbox`]; the pipeline pulls
//! from it through [`FrameSource::read`] with a bounded timeout.

use std::time::Duration;

#[cfg(feature = "opencv")]
mod camera;
mod ffmpeg;
pub mod mailbox;
mod types;

#[cfg(feature = "opencv")]
pub use camera::OpencvSource;
pub use ffmpeg::FfmpegSource;
pub use mailbox::Mailbox;
pub use types::{CaptureError, Frame, FrameFormat};

/// Source of decoded frames at a fixed working resolution.
pub trait FrameSource: Send {
    /// Block up to `timeout` for the most recent decoded frame.
    ///
    /// Implementations return [`CaptureError::NoFrame`] for a transient miss
    /// (stream hiccup, decoder error, nothing decoded yet) so the caller can
    /// retry on its next tick.
    fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    /// Human readable description used in log lines.
    fn describe(&self) -> String {
        "frame source".to_string()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        (**self).read(timeout)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Ingress transport used to source frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local V4L devices or pre-recorded files.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else {
            SourceKind::Device
        }
    }
}

/// Decoder backend used to open a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Ffmpeg,
    #[cfg(feature = "opencv")]
    Opencv,
}

/// Everything needed to open a camera feed.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub backend: Backend,
    /// Delay before reconnecting after the upstream stream ends.
    pub reopen_delay: Duration,
}

impl SourceOptions {
    pub fn new(uri: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            uri: uri.into(),
            width,
            height,
            fps,
            backend: Backend::Ffmpeg,
            reopen_delay: Duration::from_secs(1),
        }
    }

    pub fn kind(&self) -> SourceKind {
        SourceKind::from_uri(&self.uri)
    }
}

/// Open the configured backend and start decoding in the background.
pub fn open_source(options: &SourceOptions) -> Result<Box<dyn FrameSource>, CaptureError> {
    match options.backend {
        Backend::Ffmpeg => Ok(Box::new(FfmpegSource::spawn(options.clone())?)),
        #[cfg(feature = "opencv")]
        Backend::Opencv => Ok(Box::new(OpencvSource::spawn(options.clone())?)),
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}
