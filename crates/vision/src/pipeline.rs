//! Pipeline orchestrator tying together capture, view extraction, the
//! per-channel encoders and the stream channels.
//!
//! The acquisition loop runs on its own thread. Per tick it reads one frame,
//! fans it out into named views, overwrites each encoder's input slot and
//! publishes whatever encoder output is ready. Nothing in the loop waits on
//! an encoder or on a stream reader.

use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};
use video_ingest::FrameSource;

use crate::{
    error::PipelineError,
    extract::ViewExtractor,
    roi::RoiStore,
    stream::{ChannelSet, StreamChannel},
    telemetry,
    worker::{EncodingWorker, RawView, WorkerOutput, WorkerPort, WorkerSettings},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopped,
}

impl PipelineState {
    pub const fn label(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
        }
    }
}

/// Observable outcome of one acquisition tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    AcquisitionFailure { reason: String },
    Published { channel: String, sequence: u64 },
    EncodeFailure { channel: String, sequence: u64 },
}

#[derive(Clone, Debug)]
pub struct AcquisitionOptions {
    /// Target acquisition rate; one period is also the retry backoff.
    pub fps: u32,
    pub read_timeout: Duration,
    /// Frames between two acquisition rate log lines.
    pub fps_log_every: u64,
}

impl AcquisitionOptions {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            fps: 10,
            read_timeout: Duration::from_secs(1),
            fps_log_every: 100,
        }
    }
}

/// Running totals, readable while the pipeline runs.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames: AtomicU64,
    pub acquisition_failures: AtomicU64,
    pub publishes: AtomicU64,
    pub encode_failures: AtomicU64,
}

pub struct Pipeline {
    state: PipelineState,
    source: Option<Box<dyn FrameSource>>,
    extractor: Arc<ViewExtractor>,
    roi: Arc<RoiStore>,
    channels: ChannelSet,
    workers: Vec<EncodingWorker>,
    acquisition: AcquisitionOptions,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    events: Option<Sender<PipelineEvent>>,
    handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Build an idle pipeline. The extractor's view names must be exactly the
    /// channel names; one encoder is created per channel.
    pub fn new(
        source: Box<dyn FrameSource>,
        extractor: ViewExtractor,
        roi: Arc<RoiStore>,
        channels: ChannelSet,
        acquisition: AcquisitionOptions,
        worker_settings: WorkerSettings,
    ) -> Result<Self, PipelineError> {
        let view_names = extractor.names();
        let channel_names: BTreeSet<&str> = channels.names().collect();
        if view_names != channel_names {
            return Err(PipelineError::Config(format!(
                "views {view_names:?} do not match channels {channel_names:?}"
            )));
        }
        if acquisition.fps == 0 {
            return Err(PipelineError::Config("acquisition fps must be positive".into()));
        }
        if channels.iter().any(|c| c.format() != worker_settings.encode.format) {
            return Err(PipelineError::Config(
                "channel format differs from encoder format".into(),
            ));
        }

        let workers = channels
            .names()
            .map(|name| EncodingWorker::new(name, worker_settings.clone()))
            .collect();

        Ok(Self {
            state: PipelineState::Idle,
            source: Some(source),
            extractor: Arc::new(extractor),
            roi,
            channels,
            workers,
            acquisition,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::default()),
            events: None,
            handle: None,
        })
    }

    /// Report every tick outcome on `events`.
    pub fn with_events(mut self, events: Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Start every encoder, then the acquisition loop. If any encoder fails
    /// to start, the ones already running are stopped and the pipeline stays
    /// idle.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Idle {
            return Err(PipelineError::InvalidState {
                action: "start",
                state: self.state.label(),
            });
        }

        for index in 0..self.workers.len() {
            if let Err(err) = self.workers[index].start() {
                error!("{err}");
                for worker in self.workers[..index].iter_mut().rev() {
                    worker.stop();
                }
                return Err(err);
            }
        }

        let Some(source) = self.source.take() else {
            return Err(PipelineError::InvalidState {
                action: "start",
                state: "missing its frame source",
            });
        };

        let lanes = self
            .workers
            .iter()
            .filter_map(|worker| {
                let channel = self.channels.get(worker.channel())?.clone();
                Some(Lane {
                    port: worker.port(),
                    channel,
                })
            })
            .collect();

        self.running.store(true, Ordering::SeqCst);
        let acquisition = AcquisitionLoop {
            source,
            extractor: self.extractor.clone(),
            roi: self.roi.clone(),
            lanes,
            options: self.acquisition.clone(),
            running: self.running.clone(),
            stats: self.stats.clone(),
            events: self.events.clone(),
        };
        let handle = match telemetry::spawn_thread("pipeline-acquisition", move || acquisition.run()) {
            Ok(handle) => handle,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                for worker in self.workers.iter_mut() {
                    worker.stop();
                }
                self.state = PipelineState::Stopped;
                return Err(PipelineError::Config(format!(
                    "failed to spawn acquisition thread: {err}"
                )));
            }
        };
        self.handle = Some(handle);
        self.state = PipelineState::Running;
        info!(
            channels = ?self.channels.names().collect::<Vec<_>>(),
            fps = self.acquisition.fps,
            "Pipeline running"
        );
        Ok(())
    }

    /// Stop the acquisition loop, then every encoder in channel order. Returns
    /// once every thread and child process has terminated.
    pub fn stop(&mut self) {
        if self.state != PipelineState::Running {
            self.state = PipelineState::Stopped;
            return;
        }
        debug!("Stopping pipeline");
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Acquisition thread panicked");
            }
        }
        for worker in self.workers.iter_mut() {
            worker.stop();
        }
        self.state = PipelineState::Stopped;
        info!(
            frames = self.stats.frames.load(Ordering::Relaxed),
            acquisition_failures = self.stats.acquisition_failures.load(Ordering::Relaxed),
            "Pipeline stopped"
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One encoder and the channel its output is published to.
struct Lane {
    port: WorkerPort,
    channel: Arc<StreamChannel>,
}

struct AcquisitionLoop {
    source: Box<dyn FrameSource>,
    extractor: Arc<ViewExtractor>,
    roi: Arc<RoiStore>,
    lanes: Vec<Lane>,
    options: AcquisitionOptions,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    events: Option<Sender<PipelineEvent>>,
}

impl AcquisitionLoop {
    fn run(mut self) {
        let span = tracing::info_span!(
            "pipeline.acquisition",
            source = %self.source.describe(),
            fps = self.options.fps
        );
        let _guard = span.enter();
        let period = self.options.period();
        let mut meter = RateMeter::new(self.options.fps_log_every);
        let mut sequence: u64 = 0;

        while self.running.load(Ordering::Acquire) {
            let frame = tracing::info_span!("capture.read")
                .in_scope(|| self.source.read(self.options.read_timeout));
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    let failures = self.stats.acquisition_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    let failure = PipelineError::AcquisitionFailure(err);
                    warn!(failures, "{failure}; retrying in {period:?}");
                    metrics::counter!(telemetry::ACQUISITION_FAILURES).increment(1);
                    self.emit(PipelineEvent::AcquisitionFailure {
                        reason: failure.to_string(),
                    });
                    self.sleep_while_running(period);
                    continue;
                }
            };

            sequence += 1;
            self.stats.frames.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::FRAMES).increment(1);
            if let Some(fps) = meter.tick(Instant::now()) {
                metrics::gauge!(telemetry::ACQUISITION_FPS).set(fps as f64);
            }

            let _tick = tracing::info_span!("pipeline.tick", frame = sequence).entered();
            let roi = self.roi.get();
            let mut views = self.extractor.extract(frame, &roi);
            for lane in &self.lanes {
                if let Some(frame) = views.remove(lane.channel.name()) {
                    if lane.port.submit(RawView { sequence, frame }) {
                        debug!(channel = lane.channel.name(), "Encoder busy; replaced pending view");
                    }
                }
            }
            self.collect_outputs();
        }
        debug!("Acquisition loop exited");
    }

    /// Publish whatever each encoder finished since the last tick. A lane
    /// without new output keeps its previous buffer published.
    fn collect_outputs(&self) {
        for lane in &self.lanes {
            let Some(output) = lane.port.collect() else {
                continue;
            };
            let channel = lane.channel.name().to_string();
            match output {
                WorkerOutput::Encoded(buffer) => {
                    let sequence = buffer.sequence;
                    if lane.channel.publish(buffer) {
                        self.stats.publishes.fetch_add(1, Ordering::Relaxed);
                        self.emit(PipelineEvent::Published { channel, sequence });
                    }
                }
                WorkerOutput::Failed { sequence, message } => {
                    self.stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(telemetry::ENCODER_FAILURES, "channel" => channel.clone())
                        .increment(1);
                    let failure = PipelineError::EncodeFailure {
                        channel: channel.clone(),
                        sequence,
                        message,
                    };
                    error!("{failure}");
                    self.emit(PipelineEvent::EncodeFailure { channel, sequence });
                }
            }
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn sleep_while_running(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }
}

/// Acquisition rate diagnostics: an exponentially smoothed instantaneous rate
/// plus a rolling rate logged every `log_every` frames.
struct RateMeter {
    log_every: u64,
    frames: u64,
    last: Option<Instant>,
    smoothed: f32,
    window: VecDeque<Instant>,
}

impl RateMeter {
    fn new(log_every: u64) -> Self {
        let log_every = log_every.max(1);
        Self {
            log_every,
            frames: 0,
            last: None,
            smoothed: 0.0,
            window: VecDeque::with_capacity(log_every as usize + 1),
        }
    }

    /// Record a frame at `now`; returns the smoothed rate once it is known.
    fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        self.window.push_back(now);
        if self.window.len() as u64 > self.log_every {
            self.window.pop_front();
        }

        let previous = self.last.replace(now)?;
        let elapsed = now.duration_since(previous).as_secs_f32();
        if elapsed > 0.0 {
            let instant = 1.0 / elapsed;
            self.smoothed = if self.smoothed == 0.0 {
                instant
            } else {
                0.9 * self.smoothed + 0.1 * instant
            };
        }

        if self.frames % self.log_every == 0 {
            info!(
                "Acquisition heartbeat: frame #{}, {:.1} fps over the last {} frames ({:.1} smoothed)",
                self.frames,
                self.window_rate().unwrap_or(0.0),
                self.window.len(),
                self.smoothed
            );
        }
        Some(self.smoothed)
    }

    fn window_rate(&self) -> Option<f32> {
        let first = self.window.front()?;
        let last = self.window.back()?;
        let span = last.duration_since(*first).as_secs_f32();
        (span > 0.0).then(|| (self.window.len() - 1) as f32 / span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_meter_tracks_steady_rate() {
        let mut meter = RateMeter::new(10);
        let start = Instant::now();
        assert_eq!(meter.tick(start), None);
        let mut last = None;
        for i in 1..=20u32 {
            last = meter.tick(start + Duration::from_millis(100) * i);
        }
        let smoothed = last.unwrap();
        assert!((smoothed - 10.0).abs() < 0.5, "{smoothed}");
        let window = meter.window_rate().unwrap();
        assert!((window - 10.0).abs() < 0.5, "{window}");
    }

    #[test]
    fn backoff_is_one_period() {
        let options = AcquisitionOptions {
            fps: 4,
            ..AcquisitionOptions::default()
        };
        assert_eq!(options.period(), Duration::from_millis(250));
    }
}
