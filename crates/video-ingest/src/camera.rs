//! OpenCV-backed camera capture.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    FrameSource, SourceOptions,
    mailbox::Mailbox,
    parse_device_index,
    types::{CaptureError, Frame, FrameFormat},
};

/// Frame source decoding through OpenCV's `VideoCapture` on a background
/// thread. Each decoded frame is resized to the working resolution and
/// overwrites the single-slot mailbox.
pub struct OpencvSource {
    options: SourceOptions,
    latest: Mailbox<Frame>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OpencvSource {
    pub fn spawn(options: SourceOptions) -> Result<Self, CaptureError> {
        let mut cap = open_video_capture(&options.uri)?;
        configure_camera(&mut cap, (options.width as i32, options.height as i32), options.fps as f64);

        let latest = Mailbox::new();
        let running = Arc::new(AtomicBool::new(true));
        let thread_latest = latest.clone();
        let thread_running = running.clone();
        let thread_options = options.clone();
        let handle = thread::Builder::new()
            .name("opencv-capture".into())
            .spawn(move || {
                if let Err(err) = capture_loop(cap, &thread_options, &thread_latest, &thread_running) {
                    warn!("opencv capture for {} stopped: {err}", thread_options.uri);
                }
            })
            .map_err(|err| CaptureError::Other(err.into()))?;

        Ok(Self {
            options,
            latest,
            running,
            handle: Some(handle),
        })
    }
}

impl FrameSource for OpencvSource {
    fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        match self.latest.take_timeout(timeout) {
            Some(frame) => Ok(frame),
            None if self.handle.as_ref().is_some_and(|h| h.is_finished()) => {
                Err(CaptureError::Disconnected)
            }
            None => Err(CaptureError::NoFrame),
        }
    }

    fn describe(&self) -> String {
        format!("opencv source {}", self.options.uri)
    }
}

impl Drop for OpencvSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn capture_loop(
    mut cap: VideoCapture,
    options: &SourceOptions,
    latest: &Mailbox<Frame>,
    running: &AtomicBool,
) -> Result<(), CaptureError> {
    let mut frame = Mat::default();
    let mut scratch = Mat::default();
    let (target_w, target_h) = (options.width as i32, options.height as i32);

    while running.load(Ordering::Relaxed) {
        let grabbed = cap
            .read(&mut frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed || size.width <= 0 {
            debug!("opencv read returned no frame for {}", options.uri);
            thread::sleep(Duration::from_millis(1_000 / options.fps.max(1) as u64));
            continue;
        }

        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &frame,
                &mut scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &scratch
        } else {
            &frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        latest.put(Frame {
            data,
            width: options.width,
            height: options.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        });
    }

    Ok(())
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => warn!("failed to open device #{index} with backend {backend}: {err}"),
            }
        }
    }

    for backend in [videoio::CAP_FFMPEG, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => warn!("failed to open {uri} with backend {backend}: {err}"),
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply capture settings (resolution, fps) and keep the driver buffer short.
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
}
