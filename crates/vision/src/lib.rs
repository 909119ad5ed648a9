//! Real-time region-of-interest streaming.
//!
//! Frames from a [`video_ingest::FrameSource`] are split into named views
//! (the full frame and a perspective-corrected region of interest), each view
//! is compressed by its own [`worker::EncodingWorker`], and the newest image of
//! every view is served to HTTP clients through a [`stream::StreamChannel`].

pub mod config;
pub mod encoding;
pub mod error;
pub mod extract;
pub mod geometry;
pub mod pipeline;
pub mod roi;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod worker;

pub use config::{PipelineConfig, ServeArgs, TelemetryOptions};
pub use encoding::{CompressedBuffer, EncodeFormat, EncodeSettings};
pub use error::PipelineError;
pub use extract::{MAIN_VIEW, ROI_VIEW, ViewExtractor, ViewKind, ViewSpec};
pub use geometry::{GeometryError, Point, Quadrilateral, Rect, Size};
pub use pipeline::{AcquisitionOptions, Pipeline, PipelineEvent, PipelineState};
pub use roi::RoiStore;
pub use stream::{ChannelSet, StreamChannel, StreamReader};
pub use worker::{EncodingWorker, Isolation, WorkerSettings, WorkerState};
