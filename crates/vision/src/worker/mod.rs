//! Per-channel encoders running apart from the acquisition loop.
//!
//! Each worker owns two single-slot mailboxes: the pipeline overwrites the
//! input slot with the newest raw view and opportunistically takes whatever
//! sits in the output slot. A worker that falls behind therefore skips
//! frames instead of queueing them.
//!
//! The encoder itself runs either on a dedicated thread or in a child
//! process (`encode-worker` subcommand) fed through [`protocol`].

mod process;
pub mod protocol;

use std::{
    path::PathBuf,
    process::Child,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info};
use video_ingest::{Frame, Mailbox};

use crate::{
    encoding::{CompressedBuffer, EncodeSettings, encode_frame},
    error::PipelineError,
    telemetry,
};

pub use process::serve_encoder;

/// How long a worker loop waits on its input slot before re-checking the
/// running flag.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Isolation {
    Thread,
    /// Spawn `program encode-worker ...` per channel.
    Process { program: PathBuf },
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub encode: EncodeSettings,
    pub isolation: Isolation,
    /// How long the encoder may take to report ready.
    pub startup_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl WorkerState {
    pub const fn label(self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        }
    }
}

/// Raw view handed to an encoder, tagged with the tick that produced it.
#[derive(Clone, Debug)]
pub struct RawView {
    pub sequence: u64,
    pub frame: Frame,
}

impl RawView {
    /// Zero-size frame telling the encoder loop to exit.
    fn stop() -> Self {
        Self {
            sequence: 0,
            frame: Frame::blank(0, 0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerOutput {
    Encoded(CompressedBuffer),
    Failed { sequence: u64, message: String },
}

impl WorkerOutput {
    pub fn sequence(&self) -> u64 {
        match self {
            WorkerOutput::Encoded(buffer) => buffer.sequence,
            WorkerOutput::Failed { sequence, .. } => *sequence,
        }
    }
}

/// Pipeline-side handle to a worker's input and output slots.
#[derive(Clone)]
pub struct WorkerPort {
    input: Mailbox<RawView>,
    output: Mailbox<WorkerOutput>,
}

impl WorkerPort {
    fn new() -> Self {
        Self {
            input: Mailbox::new(),
            output: Mailbox::new(),
        }
    }

    /// Hand over the newest raw view without blocking. Returns true when an
    /// unconsumed older view was overwritten.
    pub fn submit(&self, view: RawView) -> bool {
        self.input.put(view).is_some()
    }

    /// Latest encoder output not yet collected.
    pub fn collect(&self) -> Option<WorkerOutput> {
        self.output.take()
    }
}

pub struct EncodingWorker {
    channel: String,
    settings: WorkerSettings,
    state: WorkerState,
    port: WorkerPort,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    child: Option<Child>,
}

impl EncodingWorker {
    pub fn new(channel: impl Into<String>, settings: WorkerSettings) -> Self {
        Self {
            channel: channel.into(),
            settings,
            state: WorkerState::Stopped,
            port: WorkerPort::new(),
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            child: None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn port(&self) -> WorkerPort {
        self.port.clone()
    }

    /// Start the encoder and wait until it reports ready.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != WorkerState::Stopped {
            return Err(PipelineError::InvalidState {
                action: "start",
                state: self.state.label(),
            });
        }
        self.state = WorkerState::Starting;
        self.port = WorkerPort::new();
        self.running.store(true, Ordering::SeqCst);

        let started = match self.settings.isolation.clone() {
            Isolation::Thread => self.start_thread(),
            Isolation::Process { program } => self.start_process(program),
        };

        match started {
            Ok(()) => {
                self.state = WorkerState::Running;
                info!(
                    channel = %self.channel,
                    format = %self.settings.encode.format,
                    "Encoding worker running"
                );
                Ok(())
            }
            Err(reason) => {
                self.shutdown();
                self.state = WorkerState::Stopped;
                Err(PipelineError::WorkerStartupFailure {
                    channel: self.channel.clone(),
                    reason,
                })
            }
        }
    }

    /// Signal the encoder through the running flag and the stop sentinel,
    /// then block until it has terminated.
    pub fn stop(&mut self) {
        if self.state == WorkerState::Stopped {
            return;
        }
        self.state = WorkerState::Stopping;
        self.shutdown();
        self.state = WorkerState::Stopped;
        debug!(channel = %self.channel, "Encoding worker stopped");
    }

    fn start_thread(&mut self) -> Result<(), String> {
        let (init_tx, init_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let channel = self.channel.clone();
        let settings = self.settings.encode;
        let port = self.port.clone();
        let running = self.running.clone();
        let handle = telemetry::spawn_thread(format!("encoder-{}", self.channel), move || {
            let _ = init_tx.send(Ok(()));
            encode_loop(&channel, settings, &port, &running);
        })
        .map_err(|err| format!("failed to spawn encoder thread: {err}"))?;
        self.threads.push(handle);
        await_ready(&init_rx, self.settings.startup_timeout)
    }

    fn start_process(&mut self, program: PathBuf) -> Result<(), String> {
        let spawned = process::spawn(
            &self.channel,
            &program,
            &self.settings,
            &self.port,
            &self.running,
        )?;
        self.child = Some(spawned.child);
        self.threads.extend(spawned.threads);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.port.input.put(RawView::stop());

        // Reap before joining: a child that stopped reading can leave the
        // feeder blocked on a full pipe until the child is killed.
        if let Some(child) = self.child.take() {
            process::reap(&self.channel, child);
        }
        for handle in std::mem::take(&mut self.threads) {
            join_logged(&self.channel, handle);
        }
    }
}

impl Drop for EncodingWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_logged(channel: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!(channel, "Encoder thread panicked");
    }
}

fn await_ready(init_rx: &Receiver<Result<(), String>>, timeout: Duration) -> Result<(), String> {
    match init_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(format!("not ready within {timeout:?}")),
        Err(RecvTimeoutError::Disconnected) => Err("exited before becoming ready".to_string()),
    }
}

fn encode_loop(channel: &str, settings: EncodeSettings, port: &WorkerPort, running: &AtomicBool) {
    let _span = tracing::info_span!("encoder.worker", channel, isolation = "thread").entered();
    while running.load(Ordering::Acquire) {
        let Some(view) = port.input.take_timeout(IDLE_POLL) else {
            continue;
        };
        if view.frame.is_empty() {
            break;
        }
        let started = Instant::now();
        let outcome = encode_view(&view, &settings);
        metrics::histogram!(telemetry::ENCODER_SECONDS, "channel" => channel.to_string())
            .record(started.elapsed().as_secs_f64());
        port.output.put(outcome);
    }
}

fn encode_view(view: &RawView, settings: &EncodeSettings) -> WorkerOutput {
    match encode_frame(&view.frame, settings) {
        Ok(data) => WorkerOutput::Encoded(CompressedBuffer {
            data: Bytes::from(data),
            sequence: view.sequence,
            format: settings.format,
        }),
        Err(err) => WorkerOutput::Failed {
            sequence: view.sequence,
            message: err.to_string(),
        },
    }
}
