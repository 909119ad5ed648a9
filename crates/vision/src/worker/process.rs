//! Child-process isolation for encoding workers.

use std::{
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, error, warn};

use super::{
    IDLE_POLL, RawView, WorkerOutput, WorkerPort, WorkerSettings, await_ready, encode_view,
    protocol,
};
use crate::{
    encoding::{CompressedBuffer, EncodeFormat, EncodeSettings},
    telemetry,
};

/// Time a child gets to exit after the stop sentinel before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub(super) struct Spawned {
    pub(super) child: Child,
    pub(super) threads: Vec<JoinHandle<()>>,
}

/// Frame most recently written to the child, for round-trip timing.
type InFlight = Arc<Mutex<Option<(u64, Instant)>>>;

pub(super) fn spawn(
    channel: &str,
    program: &Path,
    settings: &WorkerSettings,
    port: &WorkerPort,
    running: &Arc<AtomicBool>,
) -> Result<Spawned, String> {
    let mut child = Command::new(program)
        .arg("encode-worker")
        .arg("--format")
        .arg(settings.encode.format.as_str())
        .arg("--quality")
        .arg(settings.encode.quality.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| format!("failed to spawn {}: {err}", program.display()))?;
    debug!(channel, pid = child.id(), "Spawned encoder process");

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        kill(&mut child);
        return Err("encoder process has no stdio pipes".to_string());
    };

    let in_flight: InFlight = Arc::new(Mutex::new(None));
    let (init_tx, init_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
    let collector = {
        let channel = channel.to_string();
        let port = port.clone();
        let running = running.clone();
        let in_flight = in_flight.clone();
        let format = settings.encode.format;
        telemetry::spawn_thread(format!("encoder-{channel}-collect"), move || {
            let mut reader = BufReader::new(stdout);
            let ready = protocol::read_handshake(&mut reader)
                .map_err(|err| format!("handshake failed: {err}"));
            let ready_ok = ready.is_ok();
            let _ = init_tx.send(ready);
            if ready_ok {
                collect_results(&channel, format, reader, &port, &running, &in_flight);
            }
        })
    };
    let collector = match collector {
        Ok(handle) => handle,
        Err(err) => {
            kill(&mut child);
            return Err(format!("failed to spawn collector thread: {err}"));
        }
    };

    if let Err(reason) = await_ready(&init_rx, settings.startup_timeout) {
        drop(stdin);
        kill(&mut child);
        let _ = collector.join();
        return Err(reason);
    }

    let feeder = {
        let channel = channel.to_string();
        let port = port.clone();
        let running = running.clone();
        telemetry::spawn_thread(format!("encoder-{channel}-feed"), move || {
            feed_frames(&channel, stdin, &port, &running, &in_flight);
        })
    };
    match feeder {
        Ok(feeder) => Ok(Spawned {
            child,
            threads: vec![feeder, collector],
        }),
        Err(err) => {
            kill(&mut child);
            let _ = collector.join();
            Err(format!("failed to spawn feeder thread: {err}"))
        }
    }
}

/// Wait for a child that was asked to stop, killing it after a grace period.
pub(super) fn reap(channel: &str, mut child: Child) {
    let deadline = Instant::now() + STOP_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!(channel, %status, "Encoder process exited with failure");
                }
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Ok(None) => {
                warn!(channel, "Encoder process ignored stop request; killing it");
                kill(&mut child);
                return;
            }
            Err(err) => {
                error!(channel, "Failed to wait for encoder process: {err}");
                kill(&mut child);
                return;
            }
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn feed_frames(
    channel: &str,
    stdin: ChildStdin,
    port: &WorkerPort,
    running: &AtomicBool,
    in_flight: &Mutex<Option<(u64, Instant)>>,
) {
    let _span = tracing::info_span!("encoder.feed", channel, isolation = "process").entered();
    let mut writer = BufWriter::new(stdin);
    while running.load(Ordering::Acquire) {
        let Some(view) = port.input.take_timeout(IDLE_POLL) else {
            continue;
        };
        if view.frame.is_empty() {
            break;
        }
        if let Ok(mut slot) = in_flight.lock() {
            *slot = Some((view.sequence, Instant::now()));
        }
        if let Err(err) = protocol::write_frame(&mut writer, view.sequence, &view.frame) {
            error!(channel, "Failed to hand frame {} to encoder process: {err}", view.sequence);
            return;
        }
    }
    if let Err(err) = protocol::write_stop(&mut writer) {
        debug!(channel, "Encoder process closed its input before stop: {err}");
    }
}

fn collect_results(
    channel: &str,
    format: EncodeFormat,
    mut reader: BufReader<ChildStdout>,
    port: &WorkerPort,
    running: &AtomicBool,
    in_flight: &Mutex<Option<(u64, Instant)>>,
) {
    let _span = tracing::info_span!("encoder.collect", channel, isolation = "process").entered();
    loop {
        match protocol::read_result(&mut reader) {
            Ok(Some((sequence, result))) => {
                record_round_trip(channel, sequence, in_flight);
                let output = match result {
                    Ok(data) => WorkerOutput::Encoded(CompressedBuffer {
                        data: Bytes::from(data),
                        sequence,
                        format,
                    }),
                    Err(message) => WorkerOutput::Failed { sequence, message },
                };
                port.output.put(output);
            }
            Ok(None) => {
                if running.load(Ordering::Acquire) {
                    error!(channel, "Encoder process exited unexpectedly");
                }
                return;
            }
            Err(err) => {
                if running.load(Ordering::Acquire) {
                    error!(channel, "Lost encoder process output: {err}");
                }
                return;
            }
        }
    }
}

fn record_round_trip(channel: &str, sequence: u64, in_flight: &Mutex<Option<(u64, Instant)>>) {
    let Ok(slot) = in_flight.lock() else {
        return;
    };
    if let Some((sent, at)) = *slot {
        if sent == sequence {
            metrics::histogram!(telemetry::ENCODER_SECONDS, "channel" => channel.to_string())
                .record(at.elapsed().as_secs_f64());
        }
    }
}

/// Child side of a process-isolated worker: announce readiness, then encode
/// every frame read from `reader` until the stop sentinel or end of input.
/// Returns the number of frames answered.
pub fn serve_encoder<R: Read, W: Write>(
    reader: R,
    writer: W,
    settings: EncodeSettings,
) -> io::Result<u64> {
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    protocol::write_handshake(&mut writer)?;

    let mut served = 0u64;
    while let Some((sequence, frame)) = protocol::read_frame(&mut reader)? {
        let output = encode_view(&RawView { sequence, frame }, &settings);
        match &output {
            WorkerOutput::Encoded(buffer) => {
                protocol::write_result(&mut writer, sequence, Ok(&buffer.data[..]))?
            }
            WorkerOutput::Failed { message, .. } => {
                warn!("Encoding frame {sequence} failed: {message}");
                protocol::write_result(&mut writer, sequence, Err(message.as_str()))?
            }
        }
        served += 1;
    }
    writer.flush()?;
    Ok(served)
}
