use thiserror::Error;
use video_ingest::CaptureError;

use crate::geometry::GeometryError;

/// Failure taxonomy of the streaming pipeline.
///
/// Tick-local and reader-local failures are logged and absorbed where they
/// happen; only failures that keep the pipeline from reaching a running state
/// are returned to callers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame acquisition failed: {0}")]
    AcquisitionFailure(#[source] CaptureError),
    #[error(transparent)]
    InvalidGeometry(#[from] GeometryError),
    #[error("encoding frame {sequence} for channel {channel:?} failed: {message}")]
    EncodeFailure {
        channel: String,
        sequence: u64,
        message: String,
    },
    #[error("encoding worker for channel {channel:?} failed to start: {reason}")]
    WorkerStartupFailure { channel: String, reason: String },
    #[error("stream reader on channel {channel:?} disconnected")]
    ConsumerTransportFailure { channel: String },
    #[error("pipeline configuration error: {0}")]
    Config(String),
    #[error("cannot {action} a pipeline that is {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
}

impl From<CaptureError> for PipelineError {
    fn from(err: CaptureError) -> Self {
        PipelineError::AcquisitionFailure(err)
    }
}
