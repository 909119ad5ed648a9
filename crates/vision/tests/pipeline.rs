use std::{
    path::PathBuf,
    sync::{Arc, atomic::Ordering},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, unbounded};
use video_ingest::{CaptureError, Frame, FrameSource};
use vision::{
    AcquisitionOptions, ChannelSet, EncodeFormat, EncodeSettings, Isolation, MAIN_VIEW, Pipeline,
    PipelineError, PipelineEvent, PipelineState, Point, Quadrilateral, ROI_VIEW, RoiStore, Size,
    ViewExtractor, ViewSpec, WorkerSettings,
};

const WIDTH: u32 = 96;
const HEIGHT: u32 = 54;

/// Camera stand-in: fails a fixed number of reads, then yields a gradient.
struct ScriptedSource {
    failures_left: usize,
    pace: Duration,
}

impl ScriptedSource {
    fn new(failures: usize) -> Self {
        Self {
            failures_left: failures,
            pace: Duration::from_millis(5),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn read(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(CaptureError::NoFrame);
        }
        thread::sleep(self.pace);
        Ok(gradient(WIDTH, HEIGHT))
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

/// Source whose every read blocks for the whole timeout and finds nothing.
struct SilentSource;

impl FrameSource for SilentSource {
    fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        thread::sleep(timeout);
        Err(CaptureError::NoFrame)
    }
}

fn gradient(width: u32, height: u32) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x * 2) as u8, (y * 4) as u8, 60]);
        }
    }
    Frame::from_bgr(data, width, height, 0).unwrap()
}

fn roi_store(quad: Quadrilateral) -> Arc<RoiStore> {
    Arc::new(RoiStore::new(quad))
}

fn default_roi() -> Quadrilateral {
    Quadrilateral::new([
        Point::new(10, 10),
        Point::new(60, 12),
        Point::new(58, 40),
        Point::new(12, 38),
    ])
    .unwrap()
}

fn thread_workers(format: EncodeFormat) -> WorkerSettings {
    WorkerSettings {
        encode: EncodeSettings {
            format,
            quality: 90,
        },
        isolation: Isolation::Thread,
        startup_timeout: Duration::from_secs(2),
    }
}

fn fast_acquisition() -> AcquisitionOptions {
    AcquisitionOptions {
        fps: 50,
        read_timeout: Duration::from_millis(200),
        fps_log_every: 100,
    }
}

fn build(
    source: impl FrameSource + 'static,
    roi: Quadrilateral,
    roi_output: Size,
    format: EncodeFormat,
) -> (Pipeline, Receiver<PipelineEvent>) {
    let (tx, rx) = unbounded();
    let channels = ChannelSet::new([MAIN_VIEW, ROI_VIEW], format);
    let pipeline = Pipeline::new(
        Box::new(source),
        ViewExtractor::standard(roi_output),
        roi_store(roi),
        channels,
        fast_acquisition(),
        thread_workers(format),
    )
    .unwrap()
    .with_events(tx);
    (pipeline, rx)
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn five_failed_reads_then_normal_publishing() {
    let (mut pipeline, events) = build(
        ScriptedSource::new(5),
        default_roi(),
        Size::new(32, 16).unwrap(),
        EncodeFormat::Jpeg,
    );
    pipeline.start().unwrap();

    let mut before_first_publish = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let event = events
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .expect("pipeline never published");
        if matches!(event, PipelineEvent::Published { .. }) {
            break;
        }
        before_first_publish.push(event);
    }
    assert_eq!(before_first_publish.len(), 5, "{before_first_publish:?}");
    assert!(before_first_publish
        .iter()
        .all(|event| matches!(event, PipelineEvent::AcquisitionFailure { .. })));

    // Both channels keep publishing after recovery.
    let channels = pipeline.channels().clone();
    assert!(wait_until(Duration::from_secs(5), || {
        channels.iter().all(|channel| channel.sequence() > 2)
    }));
    pipeline.stop();

    let later: Vec<_> = events.try_iter().collect();
    assert!(!later
        .iter()
        .any(|event| matches!(event, PipelineEvent::AcquisitionFailure { .. })));
    let stats = pipeline.stats();
    assert_eq!(stats.acquisition_failures.load(Ordering::Relaxed), 5);
    assert!(stats.publishes.load(Ordering::Relaxed) >= 2);
    assert_eq!(stats.encode_failures.load(Ordering::Relaxed), 0);
}

#[test]
fn published_sequences_never_decrease_per_channel() {
    let (mut pipeline, events) = build(
        ScriptedSource::new(0),
        default_roi(),
        Size::new(32, 16).unwrap(),
        EncodeFormat::Jpeg,
    );
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(400));
    pipeline.stop();

    let mut last = std::collections::HashMap::new();
    for event in events.try_iter() {
        if let PipelineEvent::Published { channel, sequence } = event {
            let previous = last.insert(channel, sequence).unwrap_or(0);
            assert!(sequence > previous);
        }
    }
    assert_eq!(last.len(), 2);
}

#[test]
fn stop_right_after_start_terminates() {
    for _ in 0..3 {
        let (mut pipeline, _events) = build(
            SilentSource,
            default_roi(),
            Size::new(32, 16).unwrap(),
            EncodeFormat::Jpeg,
        );
        pipeline.start().unwrap();
        let started = Instant::now();
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    let (mut pipeline, _events) = build(
        ScriptedSource::new(0),
        default_roi(),
        Size::new(32, 16).unwrap(),
        EncodeFormat::Jpeg,
    );
    pipeline.start().unwrap();
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn lifecycle_rejects_second_start() {
    let (mut pipeline, _events) = build(
        ScriptedSource::new(0),
        default_roi(),
        Size::new(32, 16).unwrap(),
        EncodeFormat::Jpeg,
    );
    assert_eq!(pipeline.state(), PipelineState::Idle);
    pipeline.start().unwrap();
    assert!(matches!(
        pipeline.start(),
        Err(PipelineError::InvalidState { .. })
    ));
    pipeline.stop();
    assert!(pipeline.start().is_err());
}

#[test]
fn full_frame_roi_matches_scaled_main_channel() {
    let roi_size = Size::new(48, 27).unwrap();
    let full = Quadrilateral::new([
        Point::new(0, 0),
        Point::new(WIDTH as i32 - 1, 0),
        Point::new(WIDTH as i32 - 1, HEIGHT as i32 - 1),
        Point::new(0, HEIGHT as i32 - 1),
    ])
    .unwrap();
    let (mut pipeline, _events) = build(ScriptedSource::new(0), full, roi_size, EncodeFormat::Png);
    pipeline.start().unwrap();
    let channels = pipeline.channels().clone();
    assert!(wait_until(Duration::from_secs(5), || {
        channels.iter().all(|channel| channel.snapshot().is_some())
    }));
    pipeline.stop();

    let decode = |name: &str| {
        let buffer = channels.get(name).unwrap().snapshot().unwrap();
        image::load_from_memory(&buffer.data).unwrap().to_rgb8()
    };
    let main = decode(MAIN_VIEW);
    let roi = decode(ROI_VIEW);
    assert_eq!(main.dimensions(), (WIDTH, HEIGHT));
    assert_eq!(roi.dimensions(), (48, 27));

    let scaled = image::imageops::resize(&main, 48, 27, image::imageops::FilterType::Triangle);
    let mut total = 0u64;
    for (a, b) in scaled.as_raw().iter().zip(roi.as_raw()) {
        total += a.abs_diff(*b) as u64;
    }
    let mean = total as f64 / scaled.as_raw().len() as f64;
    assert!(mean < 3.0, "mean abs diff {mean}");
}

#[test]
fn roi_update_takes_effect_on_a_following_tick() {
    let store = roi_store(default_roi());
    let (tx, events) = unbounded();
    let channels = ChannelSet::new([ROI_VIEW], EncodeFormat::Png);
    let extractor =
        ViewExtractor::new(vec![ViewSpec::perspective(ROI_VIEW, Size::new(8, 8).unwrap())])
            .unwrap();
    let mut pipeline = Pipeline::new(
        Box::new(ScriptedSource::new(0)),
        extractor,
        store.clone(),
        channels.clone(),
        fast_acquisition(),
        thread_workers(EncodeFormat::Png),
    )
    .unwrap()
    .with_events(tx);
    pipeline.start().unwrap();
    events.recv_timeout(Duration::from_secs(5)).unwrap();

    // Move the polygon entirely outside the frame: the view turns black.
    store
        .set(&[
            Point::new(-50, -50),
            Point::new(-20, -50),
            Point::new(-20, -20),
            Point::new(-50, -20),
        ])
        .unwrap();
    let switched_at = channels.get(ROI_VIEW).unwrap().sequence();
    assert!(wait_until(Duration::from_secs(5), || {
        let channel = channels.get(ROI_VIEW).unwrap();
        channel.sequence() > switched_at + 5
    }));
    pipeline.stop();

    let buffer = channels.get(ROI_VIEW).unwrap().snapshot().unwrap();
    let image = image::load_from_memory(&buffer.data).unwrap().to_rgb8();
    assert!(image.as_raw().iter().all(|&v| v == 0));
}

#[test]
fn mismatched_views_and_channels_are_rejected() {
    let result = Pipeline::new(
        Box::new(ScriptedSource::new(0)),
        ViewExtractor::standard(Size::new(8, 8).unwrap()),
        roi_store(default_roi()),
        ChannelSet::new([MAIN_VIEW, "overview"], EncodeFormat::Jpeg),
        fast_acquisition(),
        thread_workers(EncodeFormat::Jpeg),
    );
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn worker_startup_failure_leaves_nothing_running() {
    let mut pipeline = Pipeline::new(
        Box::new(ScriptedSource::new(0)),
        ViewExtractor::standard(Size::new(8, 8).unwrap()),
        roi_store(default_roi()),
        ChannelSet::new([MAIN_VIEW, ROI_VIEW], EncodeFormat::Jpeg),
        fast_acquisition(),
        WorkerSettings {
            isolation: Isolation::Process {
                program: PathBuf::from("/nonexistent/camera-roi"),
            },
            ..thread_workers(EncodeFormat::Jpeg)
        },
    )
    .unwrap();
    assert!(matches!(
        pipeline.start(),
        Err(PipelineError::WorkerStartupFailure { .. })
    ));
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert!(pipeline.channels().iter().all(|c| c.snapshot().is_none()));
}

#[cfg(unix)]
#[test]
fn later_worker_failure_stops_the_ones_already_started() {
    use std::os::unix::fs::PermissionsExt;

    // First launch handshakes and drains stdin until the parent closes it,
    // recording its exit. Every later launch dies before the handshake.
    let dir = tempfile::tempdir().unwrap();
    let launched = dir.path().join("launched");
    let exited = dir.path().join("exited");
    let script = dir.path().join("flaky-encoder");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\n\
             if [ -e '{launched}' ]; then exit 1; fi\n\
             touch '{launched}'\n\
             printf 'ENCW\\001\\000\\000\\000'\n\
             cat > /dev/null\n\
             touch '{exited}'\n",
            launched = launched.display(),
            exited = exited.display(),
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut pipeline = Pipeline::new(
        Box::new(ScriptedSource::new(0)),
        ViewExtractor::standard(Size::new(8, 8).unwrap()),
        roi_store(default_roi()),
        ChannelSet::new([MAIN_VIEW, ROI_VIEW], EncodeFormat::Jpeg),
        fast_acquisition(),
        WorkerSettings {
            isolation: Isolation::Process { program: script },
            ..thread_workers(EncodeFormat::Jpeg)
        },
    )
    .unwrap();

    let err = pipeline.start().unwrap_err();
    assert!(
        matches!(&err, PipelineError::WorkerStartupFailure { channel, .. } if channel == ROI_VIEW),
        "{err}"
    );
    assert!(launched.exists());
    assert!(exited.exists(), "the {MAIN_VIEW} encoder was left running");
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert!(pipeline.channels().iter().all(|c| c.snapshot().is_none()));
}
