//! Configuration parsing for the streaming pipeline.
//!
//! This module owns translation of CLI arguments into a `PipelineConfig`
//! which downstream stages use without re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, ValueEnum};
use video_ingest::{Backend, SourceOptions};

use crate::{
    encoding::{EncodeFormat, EncodeSettings},
    extract::ViewExtractor,
    geometry::{Point, Quadrilateral, Rect, Size},
    pipeline::AcquisitionOptions,
    telemetry,
    worker::{Isolation, WorkerSettings},
};

/// How each channel encoder is isolated from the acquisition loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum IsolationMode {
    /// One child process per channel.
    #[default]
    Process,
    /// One thread per channel inside this process.
    Thread,
}

/// Decoder backend selectable from the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    #[default]
    Ffmpeg,
    Opencv,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct PipelineConfig {
    /// Camera URI, working resolution and target rate.
    pub source: SourceOptions,
    /// Upper bound on a single camera read.
    pub read_timeout: Duration,
    /// Output size of the rectified region-of-interest view.
    pub roi_output: Size,
    /// Polygon used until an operator sets another.
    pub initial_roi: Quadrilateral,
    /// Where the polygon is persisted across restarts.
    pub roi_file: Option<PathBuf>,
    pub encode: EncodeSettings,
    pub isolation: IsolationMode,
    pub worker_startup_timeout: Duration,
    /// Interval between two images sent to one stream reader.
    pub stream_interval: Duration,
    pub bind: SocketAddr,
    /// Frames between two acquisition rate log lines.
    pub fps_log_every: u64,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Camera URI: rtsp://, rtsps://, /dev/videoN, a device index or a file.
    #[arg(long = "source", value_name = "URI")]
    pub source: String,
    /// Working width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 960)]
    pub width: u32,
    /// Working height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 540)]
    pub height: u32,
    /// Target acquisition rate.
    #[arg(long = "fps", default_value_t = 10)]
    pub fps: u32,
    /// Camera read timeout in milliseconds.
    #[arg(long = "read-timeout-ms", value_name = "MS", default_value_t = 1000)]
    pub read_timeout_ms: u64,
    /// Decoder backend.
    #[arg(long = "backend", value_enum, default_value_t = BackendArg::Ffmpeg)]
    pub backend: BackendArg,
    /// Region-of-interest output width.
    #[arg(long = "roi-width", value_name = "PX", default_value_t = 512)]
    pub roi_width: u32,
    /// Region-of-interest output height.
    #[arg(long = "roi-height", value_name = "PX", default_value_t = 256)]
    pub roi_height: u32,
    /// Initial polygon as x1,y1,x2,y2,x3,y3,x4,y4 (top-left first, clockwise).
    #[arg(long = "roi", value_name = "COORDS", value_delimiter = ',', allow_hyphen_values = true)]
    pub roi: Option<Vec<i32>>,
    /// Persist the polygon to this JSON file.
    #[arg(long = "roi-file", value_name = "PATH")]
    pub roi_file: Option<PathBuf>,
    /// Image format served to viewers.
    #[arg(long = "format", value_enum, default_value_t = EncodeFormat::Jpeg)]
    pub format: EncodeFormat,
    /// JPEG quality (1-100).
    #[arg(long = "quality", default_value_t = 85)]
    pub quality: u8,
    /// Encoder isolation.
    #[arg(long = "isolation", value_enum, default_value_t = IsolationMode::Process)]
    pub isolation: IsolationMode,
    /// How long an encoder may take to report ready.
    #[arg(long = "worker-startup-timeout-ms", value_name = "MS", default_value_t = 5000)]
    pub worker_startup_timeout_ms: u64,
    /// Images per second sent to each stream reader.
    #[arg(long = "stream-hz", default_value_t = 10)]
    pub stream_hz: u32,
    /// HTTP listen address.
    #[arg(long = "bind", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,
    /// Frames between two acquisition rate log lines.
    #[arg(long = "fps-log-every", value_name = "N", default_value_t = 100)]
    pub fps_log_every: u64,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<ServeArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        if args.source.trim().is_empty() {
            bail!("--source must not be empty");
        }
        if args.width == 0 || args.height == 0 {
            bail!("Working width and height must be positive integers");
        }
        if args.fps == 0 {
            bail!("--fps must be at least 1");
        }
        if args.read_timeout_ms == 0 {
            bail!("--read-timeout-ms must be at least 1");
        }
        if !(1..=100).contains(&args.quality) {
            bail!("--quality must be an integer between 1 and 100");
        }
        if args.stream_hz == 0 {
            bail!("--stream-hz must be at least 1");
        }
        if args.fps_log_every == 0 {
            bail!("--fps-log-every must be at least 1");
        }

        let roi_output = Size::new(args.roi_width, args.roi_height)
            .context("--roi-width/--roi-height")?;
        let initial_roi = match args.roi {
            Some(coords) => parse_roi(&coords)?,
            None => default_roi(roi_output)?,
        };

        let mut source = SourceOptions::new(args.source, args.width, args.height, args.fps);
        source.backend = match args.backend {
            BackendArg::Ffmpeg => Backend::Ffmpeg,
            #[cfg(feature = "opencv")]
            BackendArg::Opencv => Backend::Opencv,
            #[cfg(not(feature = "opencv"))]
            BackendArg::Opencv => bail!("--backend opencv requires building with the `opencv` feature"),
        };

        let telemetry = TelemetryOptions {
            chrome_trace_path: args.chrome_trace.map(telemetry::chrome_trace_file),
        };

        Ok(Self {
            source,
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            roi_output,
            initial_roi,
            roi_file: args.roi_file,
            encode: EncodeSettings {
                format: args.format,
                quality: args.quality,
            },
            isolation: args.isolation,
            worker_startup_timeout: Duration::from_millis(args.worker_startup_timeout_ms),
            stream_interval: Duration::from_secs_f64(1.0 / args.stream_hz as f64),
            bind: args.bind,
            fps_log_every: args.fps_log_every,
            telemetry,
        })
    }
}

impl PipelineConfig {
    pub fn acquisition(&self) -> AcquisitionOptions {
        AcquisitionOptions {
            fps: self.source.fps,
            read_timeout: self.read_timeout,
            fps_log_every: self.fps_log_every,
        }
    }

    /// Worker settings; `program` is the executable spawned for process isolation.
    pub fn worker_settings(&self, program: PathBuf) -> WorkerSettings {
        let isolation = match self.isolation {
            IsolationMode::Process => Isolation::Process { program },
            IsolationMode::Thread => Isolation::Thread,
        };
        WorkerSettings {
            encode: self.encode,
            isolation,
            startup_timeout: self.worker_startup_timeout,
        }
    }

    /// The "main" and "roi" views.
    pub fn extractor(&self) -> ViewExtractor {
        ViewExtractor::standard(self.roi_output)
    }
}

/// Rectangle at (100, 100) with the output size, so the default view is an
/// undistorted crop.
pub fn default_roi(roi_output: Size) -> Result<Quadrilateral> {
    let rect = Rect::new(Point::new(100, 100), roi_output);
    Ok(Quadrilateral::try_from(rect)?)
}

fn parse_roi(coords: &[i32]) -> Result<Quadrilateral> {
    if coords.len() != 8 {
        return Err(anyhow!(
            "--roi expects 8 comma-separated integers (4 points), got {}",
            coords.len()
        ));
    }
    let points: Vec<Point> = coords
        .chunks_exact(2)
        .map(|pair| Point::new(pair[0], pair[1]))
        .collect();
    Quadrilateral::try_from(points.as_slice()).context("--roi")
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn parse(args: &[&str]) -> Result<PipelineConfig> {
        let cli = Cli::try_parse_from(std::iter::once("serve").chain(args.iter().copied()))?;
        PipelineConfig::try_from(cli.serve)
    }

    #[test]
    fn defaults_match_deployment() {
        let config = parse(&["--source", "rtsp://cam/onvif1"]).unwrap();
        assert_eq!((config.source.width, config.source.height), (960, 540));
        assert_eq!(config.source.fps, 10);
        assert_eq!(config.roi_output, Size::new(512, 256).unwrap());
        assert_eq!(
            config.initial_roi.points(),
            &[
                Point::new(100, 100),
                Point::new(612, 100),
                Point::new(612, 356),
                Point::new(100, 356)
            ]
        );
        assert_eq!(config.encode, EncodeSettings::default());
        assert_eq!(config.isolation, IsolationMode::Process);
        assert_eq!(config.stream_interval, Duration::from_millis(100));
        assert_eq!(config.bind, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.fps_log_every, 100);
    }

    #[test]
    fn roi_flag_accepts_eight_coordinates() {
        let config = parse(&["--source", "0", "--roi", "-5,0,90,2,95,60,0,55"]).unwrap();
        assert_eq!(config.initial_roi.points()[0], Point::new(-5, 0));
        assert_eq!(config.initial_roi.points()[3], Point::new(0, 55));
    }

    #[test]
    fn invalid_values_are_rejected_before_start() {
        assert!(parse(&["--source", "0", "--roi", "1,2,3"]).is_err());
        assert!(parse(&["--source", "0", "--roi", "0,0,5,0,10,0,0,9"]).is_err());
        assert!(parse(&["--source", "0", "--quality", "0"]).is_err());
        assert!(parse(&["--source", "0", "--fps", "0"]).is_err());
        assert!(parse(&["--source", "0", "--roi-width", "0"]).is_err());
        assert!(parse(&["--source", "0", "--stream-hz", "0"]).is_err());
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn worker_settings_follow_isolation() {
        let config = parse(&["--source", "0", "--isolation", "thread", "--format", "png"]).unwrap();
        let settings = config.worker_settings(PathBuf::from("/usr/bin/camera-roi"));
        assert_eq!(settings.isolation, Isolation::Thread);
        assert_eq!(settings.encode.format, EncodeFormat::Png);
    }
}
