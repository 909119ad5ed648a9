//! Actix Web server exposing the MJPEG streams, single frames, the
//! region-of-interest endpoint and Prometheus metrics.
//!
//! The server runs on a dedicated thread with its own actix system so the
//! acquisition loop never shares a runtime with HTTP clients. Every stream
//! client gets an independent reader that wakes at the configured interval.

use std::{
    net::{SocketAddr, TcpListener},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde::{Deserialize, Serialize};
use tokio::{sync::oneshot, time::MissedTickBehavior};
use tracing::{error, info};

use crate::{
    encoding::CompressedBuffer,
    error::PipelineError,
    geometry::Point,
    roi::RoiStore,
    stream::ChannelSet,
    telemetry,
};

/// Multipart boundary used by every stream response.
pub const BOUNDARY: &str = "frame";

/// Open stream responses never complete, so graceful shutdown is bounded.
const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub struct ServerState {
    pub channels: ChannelSet,
    pub roi: Arc<RoiStore>,
    /// Interval between two images sent to one stream reader.
    pub stream_interval: Duration,
    /// Set once the server itself is closing its readers.
    closing: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new(channels: ChannelSet, roi: Arc<RoiStore>, stream_interval: Duration) -> Self {
        Self {
            channels,
            roi,
            stream_interval,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Default)]
/// Handle for the preview server thread.
pub struct PreviewServer {
    local_addr: Option<SocketAddr>,
    closing: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Deserialize)]
struct RoiUpdate {
    points: Vec<Point>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct ChannelInfo<'a> {
    name: &'a str,
    sequence: u64,
    content_type: &'static str,
}

/// Register every route on an actix `App`.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/stream/{name}", web::get().to(stream_handler))
        .route("/frame/{name}", web::get().to(frame_handler))
        .route("/api/roi", web::get().to(get_roi))
        .route("/api/roi", web::put().to(put_roi))
        .route("/api/channels", web::get().to(channels_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Bind `addr` and spawn the server thread. Bind errors surface here rather
/// than on the server thread.
pub fn spawn_preview_server(addr: SocketAddr, state: ServerState) -> Result<PreviewServer> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("Failed to bind HTTP server to {addr}"))?;
    let local_addr = listener.local_addr()?;
    let closing = state.closing.clone();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let handle = telemetry::spawn_thread("preview-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .configure(routes)
            })
            .workers(2)
            .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
            .disable_signals()
            .listen(listener)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn preview server thread")?;

    info!("HTTP server listening on http://{local_addr}");
    Ok(PreviewServer {
        local_addr: Some(local_addr),
        closing,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Registered stream reader. Dropping it (client gone, write failed)
/// deregisters the reader without touching the channel.
struct ReaderRegistration {
    channel: String,
    closing: Arc<AtomicBool>,
}

impl ReaderRegistration {
    fn new(channel: &str, closing: Arc<AtomicBool>) -> Self {
        metrics::gauge!(telemetry::STREAM_READERS, "channel" => channel.to_string()).increment(1.0);
        info!(channel, "Stream reader connected");
        Self {
            channel: channel.to_string(),
            closing,
        }
    }
}

impl Drop for ReaderRegistration {
    fn drop(&mut self) {
        metrics::gauge!(telemetry::STREAM_READERS, "channel" => self.channel.clone()).decrement(1.0);
        if self.closing.load(Ordering::SeqCst) {
            info!(channel = %self.channel, "Stream reader closed by server shutdown");
            return;
        }
        let closed = PipelineError::ConsumerTransportFailure {
            channel: self.channel.clone(),
        };
        info!("{closed}");
    }
}

/// One multipart section carrying `buffer`.
fn multipart_part(buffer: &CompressedBuffer) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: {}\r\nContent-Length: {}\r\nX-Sequence: {}\r\n\r\n",
        buffer.format.content_type(),
        buffer.data.len(),
        buffer.sequence
    );
    let mut payload = Vec::with_capacity(head.len() + buffer.data.len() + 2);
    payload.extend_from_slice(head.as_bytes());
    payload.extend_from_slice(&buffer.data);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

fn unknown_channel(name: &str) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorBody {
        error: format!("unknown channel {name:?}"),
    })
}

/// Stream one channel as `multipart/x-mixed-replace`, one part per interval.
async fn stream_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let name = path.into_inner();
    let Some(channel) = state.channels.get(&name) else {
        return unknown_channel(&name);
    };
    let mut reader = channel.reader(state.stream_interval);
    let registration = ReaderRegistration::new(&name, state.closing.clone());

    let stream = stream! {
        let _registration = registration;
        let mut interval = actix_web::rt::time::interval(reader.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Some(buffer) = reader.poll() {
                yield Ok::<Bytes, actix_web::Error>(multipart_part(&buffer));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header((header::CACHE_CONTROL, "no-cache, private"))
        .append_header((header::PRAGMA, "no-cache"))
        .append_header((
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        ))
        .streaming(stream)
}

/// Latest image of one channel, 204 before the first publish.
async fn frame_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let name = path.into_inner();
    let Some(channel) = state.channels.get(&name) else {
        return unknown_channel(&name);
    };
    match channel.snapshot() {
        Some(buffer) => HttpResponse::Ok()
            .append_header((header::CACHE_CONTROL, "no-cache"))
            .append_header(("X-Sequence", buffer.sequence.to_string()))
            .content_type(buffer.format.content_type())
            .body(buffer.data.clone()),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn get_roi(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.roi.get())
}

/// Replace the polygon; 400 when it is not exactly four usable points.
async fn put_roi(body: web::Json<RoiUpdate>, state: web::Data<ServerState>) -> HttpResponse {
    // Persisting touches the filesystem.
    let roi = state.roi.clone();
    let points = body.into_inner().points;
    match web::block(move || roi.set(&points)).await {
        Ok(Ok(quad)) => {
            info!(points = ?quad.points(), "Region of interest updated");
            HttpResponse::Ok().json(quad)
        }
        Ok(Err(err)) => HttpResponse::BadRequest().json(ErrorBody {
            error: err.to_string(),
        }),
        Err(err) => {
            error!("Region of interest update was cancelled: {err}");
            HttpResponse::InternalServerError().json(ErrorBody {
                error: "region of interest update failed".to_string(),
            })
        }
    }
}

async fn channels_handler(state: web::Data<ServerState>) -> HttpResponse {
    let channels: Vec<ChannelInfo<'_>> = state
        .channels
        .iter()
        .map(|channel| ChannelInfo {
            name: channel.name(),
            sequence: channel.sequence(),
            content_type: channel.format().content_type(),
        })
        .collect();
    HttpResponse::Ok().json(channels)
}

async fn metrics_handler() -> HttpResponse {
    let body = telemetry::prometheus_handle()
        .map(|handle| handle.render())
        .unwrap_or_default();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body)
}
