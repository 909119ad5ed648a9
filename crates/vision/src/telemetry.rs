//! Tracing subscribers, Prometheus metrics and thread helpers.

use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::config::TelemetryOptions;

pub const ACQUISITION_FAILURES: &str = "camera_acquisition_failures_total";
pub const FRAMES: &str = "camera_frames_total";
pub const ACQUISITION_FPS: &str = "camera_acquisition_fps";
pub const ENCODER_FAILURES: &str = "encoder_failures_total";
pub const ENCODER_SECONDS: &str = "encoder_seconds";
pub const STREAM_PUBLISHES: &str = "stream_publishes_total";
pub const STREAM_READERS: &str = "stream_readers";

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Flushes the Chrome trace on drop. Also holds the thread-local fallback
/// installed when a global subscriber already existed.
pub struct TelemetryGuard {
    _default_guard: Option<tracing::dispatcher::DefaultGuard>,
    chrome_guard: Option<tracing_chrome::FlushGuard>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
        }
    }
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            tracing::warn!("metrics recorder already installed, /metrics stays empty: {err}");
        }
        describe_metrics();

        let upkeep_handle = handle.clone();
        if let Err(err) = spawn_thread("prometheus-upkeep", move || loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }) {
            tracing::warn!("failed to spawn prometheus upkeep thread: {err}");
        }

        handle
    })
}

/// Access the Prometheus handle when already initialised.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

fn describe_metrics() {
    metrics::describe_counter!(ACQUISITION_FAILURES, "Camera reads that produced no frame");
    metrics::describe_counter!(FRAMES, "Frames acquired from the camera");
    metrics::describe_gauge!(ACQUISITION_FPS, "Smoothed acquisition rate in frames per second");
    metrics::describe_counter!(ENCODER_FAILURES, "Frames a channel encoder failed to compress");
    metrics::describe_histogram!(ENCODER_SECONDS, "Time spent compressing one view");
    metrics::describe_counter!(STREAM_PUBLISHES, "Buffers published to a stream channel");
    metrics::describe_gauge!(STREAM_READERS, "Connected stream readers per channel");
}

/// Install the subscriber used while the pipeline runs.
///
/// The subscriber is process-wide: HTTP worker threads are spawned by actix
/// and never see a thread-local default. `RUST_LOG` drives the filter
/// (default `info`). When a Chrome trace path is configured, spans are
/// additionally written there.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let dispatch = tracing::Dispatch::new(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(fmt::time::uptime())
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    );
    let default_guard = match tracing::dispatcher::set_global_default(dispatch.clone()) {
        Ok(()) => None,
        Err(_) => {
            let guard = tracing::dispatcher::set_default(&dispatch);
            tracing::warn!("global tracing subscriber already set, logging on this thread only");
            Some(guard)
        }
    };

    TelemetryGuard {
        _default_guard: default_guard,
        chrome_guard,
    }
}

/// Subscriber for encoder child processes. Stdout carries the wire protocol,
/// so logs go to stderr.
pub fn enter_worker_process() -> tracing::subscriber::DefaultGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(false)
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    )
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

/// Chrome trace file name for `path`, used when the caller passes a directory.
pub fn chrome_trace_file(path: PathBuf) -> PathBuf {
    if path.is_dir() {
        path.join(format!(
            "camera-roi-{}.json",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        ))
    } else {
        path
    }
}
