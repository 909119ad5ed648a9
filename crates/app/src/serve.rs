//! The `serve` subcommand: wire the camera, pipeline and HTTP server together
//! and run until Ctrl+C.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{info, warn};
use vision::{
    ChannelSet, Pipeline, PipelineConfig, RoiStore,
    server::{ServerState, spawn_preview_server},
    telemetry,
};

pub fn run(config: PipelineConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let serve_span = tracing::info_span!(
        "camera_roi.serve",
        source = %config.source.uri,
        width = config.source.width,
        height = config.source.height,
        fps = config.source.fps,
        format = %config.encode.format,
        isolation = ?config.isolation
    );
    let _serve_guard = serve_span.enter();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    }

    let roi = Arc::new(match &config.roi_file {
        Some(path) => RoiStore::with_persistence(config.initial_roi, path),
        None => RoiStore::new(config.initial_roi),
    });
    let extractor = config.extractor();
    let channels = ChannelSet::new(extractor.names(), config.encode.format);
    let program = std::env::current_exe().context("Failed to resolve the encoder executable")?;

    let source = video_ingest::open_source(&config.source)
        .with_context(|| format!("Failed to open video source {}", config.source.uri))?;
    info!("Capturing from {}", source.describe());

    let mut pipeline = Pipeline::new(
        source,
        extractor,
        roi.clone(),
        channels.clone(),
        config.acquisition(),
        config.worker_settings(program),
    )?;
    pipeline.start().context("Failed to start pipeline")?;

    let server = match spawn_preview_server(
        config.bind,
        ServerState::new(channels.clone(), roi, config.stream_interval),
    ) {
        Ok(server) => server,
        Err(err) => {
            pipeline.stop();
            return Err(err);
        }
    };
    for name in channels.names() {
        info!("Streaming {name} at http://{}/stream/{name}", config.bind);
    }
    info!("Running, press Ctrl+C to stop");

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    info!("Shutting down");
    server.stop();
    pipeline.stop();
    Ok(())
}
