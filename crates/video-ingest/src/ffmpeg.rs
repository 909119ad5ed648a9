use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    FrameSource, SourceKind, SourceOptions,
    mailbox::Mailbox,
    parse_device_index,
    types::{CaptureError, Frame},
};

/// Camera source backed by an `ffmpeg` subprocess emitting raw BGR24 frames.
///
/// A reader thread pulls fixed-size frames from the child's stdout and
/// overwrites a single-slot mailbox, so the pipeline only ever sees the most
/// recent decoded frame. When the child exits (network drop, camera reboot)
/// it is relaunched after `reopen_delay` until the source is dropped.
pub struct FfmpegSource {
    options: SourceOptions,
    latest: Mailbox<Frame>,
    running: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FfmpegSource {
    /// Launch ffmpeg for `options.uri` and start the reader thread.
    ///
    /// Fails with [`CaptureError::Open`] when the first launch fails, for
    /// example when the `ffmpeg` binary is missing.
    pub fn spawn(options: SourceOptions) -> Result<Self, CaptureError> {
        if options.width == 0 || options.height == 0 || options.fps == 0 {
            return Err(CaptureError::Other(anyhow!(
                "working size and fps must be positive (got {}x{} @ {})",
                options.width,
                options.height,
                options.fps
            )));
        }

        let (child, stdout) = launch(&options).map_err(|err| {
            warn!("ffmpeg launch for {} failed: {err}", options.uri);
            CaptureError::Open {
                uri: options.uri.clone(),
            }
        })?;
        info!(
            "ffmpeg capture started for {} ({:?}, {}x{} @ {} fps)",
            options.uri,
            options.kind(),
            options.width,
            options.height,
            options.fps
        );

        let latest = Mailbox::new();
        let running = Arc::new(AtomicBool::new(true));
        let child = Arc::new(Mutex::new(Some(child)));

        let thread_options = options.clone();
        let thread_latest = latest.clone();
        let thread_running = running.clone();
        let thread_child = child.clone();
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let handle = thread::Builder::new()
            .name("ffmpeg-capture".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    reader_loop(
                        thread_options,
                        stdout,
                        thread_latest,
                        thread_running,
                        thread_child,
                    )
                })
            })
            .map_err(|err| CaptureError::Other(err.into()))?;

        Ok(Self {
            options,
            latest,
            running,
            child,
            handle: Some(handle),
        })
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        match self.latest.take_timeout(timeout) {
            Some(frame) => frame.resized(self.options.width, self.options.height),
            None => {
                if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
                    Err(CaptureError::Disconnected)
                } else {
                    Err(CaptureError::NoFrame)
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("ffmpeg {:?} source {}", self.options.kind(), self.options.uri)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Killing the child closes its stdout, which unblocks the reader.
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn reader_loop(
    options: SourceOptions,
    first_stdout: ChildStdout,
    latest: Mailbox<Frame>,
    running: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
) {
    let mut stdout = Some(first_stdout);
    while running.load(Ordering::Relaxed) {
        let current = match stdout.take() {
            Some(current) => current,
            None => match launch(&options) {
                Ok((new_child, new_stdout)) => {
                    if let Ok(mut guard) = child.lock() {
                        *guard = Some(new_child);
                    }
                    info!("ffmpeg capture reopened for {}", options.uri);
                    new_stdout
                }
                Err(err) => {
                    warn!("ffmpeg relaunch for {} failed: {err}", options.uri);
                    sleep_while_running(&running, options.reopen_delay);
                    continue;
                }
            },
        };

        let result = pump_frames(current, (options.width, options.height), &latest, &running);
        reap_child(&child);

        if !running.load(Ordering::Relaxed) {
            break;
        }
        match result {
            Ok(()) => warn!(
                "ffmpeg stream for {} ended; reopening in {:?}",
                options.uri, options.reopen_delay
            ),
            Err(err) => warn!(
                "ffmpeg stream for {} failed ({err}); reopening in {:?}",
                options.uri, options.reopen_delay
            ),
        }
        sleep_while_running(&running, options.reopen_delay);
    }
    debug!("ffmpeg reader for {} stopped", options.uri);
}

/// Read fixed-size BGR24 frames until EOF or a read error.
fn pump_frames(
    mut stdout: impl Read,
    target_size: (u32, u32),
    latest: &Mailbox<Frame>,
    running: &AtomicBool,
) -> Result<(), CaptureError> {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];

    while running.load(Ordering::Relaxed) {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                latest.put(Frame {
                    data: buffer.clone(),
                    width: target_size.0,
                    height: target_size.1,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: crate::FrameFormat::Bgr8,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(CaptureError::Other(err.into())),
        }
    }
    Ok(())
}

fn reap_child(child: &Mutex<Option<Child>>) {
    if let Ok(mut guard) = child.lock() {
        if let Some(mut finished) = guard.take() {
            let _ = finished.kill();
            let _ = finished.wait();
        }
    }
}

fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

/// Spawn the ffmpeg child for `options` and hand back its stdout.
fn launch(options: &SourceOptions) -> Result<(Child, ChildStdout), CaptureError> {
    let mut cmd = build_command(options);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    Ok((child, stdout))
}

/// Build the ffmpeg invocation for the source kind.
pub(crate) fn build_command(options: &SourceOptions) -> Command {
    let filter = format!(
        "fps={},scale={}:{}",
        options.fps, options.width, options.height
    );
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    match options.kind() {
        SourceKind::Rtsp => {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-max_delay")
                .arg("0")
                .arg("-i")
                .arg(&options.uri);
        }
        SourceKind::Device => {
            if let Some(index) = parse_device_index(&options.uri) {
                cmd.arg("-f")
                    .arg("video4linux2")
                    .arg("-i")
                    .arg(format!("/dev/video{index}"));
            } else {
                cmd.arg("-re").arg("-i").arg(&options.uri);
            }
        }
    }

    cmd.arg("-an")
        .arg("-vf")
        .arg(&filter)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");

    cmd
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn rtsp_command_scales_and_limits_rate() {
        let options = SourceOptions::new("rtsp://admin@cam:554/onvif1", 960, 540, 10);
        let args = args_of(&build_command(&options));
        assert!(args.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
        assert!(args.windows(2).any(|w| w == ["-vf", "fps=10,scale=960:540"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn device_index_maps_to_v4l2() {
        let options = SourceOptions::new("1", 320, 240, 5);
        let args = args_of(&build_command(&options));
        assert!(args.windows(2).any(|w| w == ["-i", "/dev/video1"]));
        assert!(args.windows(2).any(|w| w == ["-f", "video4linux2"]));
    }

    #[test]
    fn pump_keeps_only_latest_frame() {
        let mut bytes = vec![1u8; 2 * 2 * 3];
        bytes.extend(vec![2u8; 2 * 2 * 3]);
        bytes.extend(vec![3u8; 2 * 2 * 3]);
        let latest = Mailbox::new();
        let running = AtomicBool::new(true);
        pump_frames(Cursor::new(bytes), (2, 2), &latest, &running).unwrap();
        let frame = latest.take().unwrap();
        assert_eq!(frame.data, vec![3u8; 12]);
        assert!(latest.take().is_none());
    }
}
