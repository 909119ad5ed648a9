use std::io;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use vision::{EncodeFormat, EncodeSettings, PipelineConfig, ServeArgs, telemetry, worker};

#[derive(Debug, Parser)]
#[command(
    name = "camera-roi",
    version,
    about = "Stream a camera feed and a perspective-corrected region of interest over HTTP"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture, extract, encode and serve every view.
    Serve(ServeArgs),
    /// Encoder child process spawned by `serve`; speaks the worker protocol on stdio.
    #[command(hide = true)]
    EncodeWorker(EncodeWorkerArgs),
}

#[derive(Debug, Args)]
struct EncodeWorkerArgs {
    #[arg(long = "format", value_enum, default_value_t = EncodeFormat::Jpeg)]
    format: EncodeFormat,
    #[arg(long = "quality", default_value_t = 85, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,
}

pub fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => {
            let config = PipelineConfig::try_from(args)?;
            crate::serve::run(config)
        }
        Command::EncodeWorker(args) => run_encode_worker(args),
    }
}

fn run_encode_worker(args: EncodeWorkerArgs) -> Result<()> {
    let _telemetry_guard = telemetry::enter_worker_process();
    // The parent owns shutdown: a terminal Ctrl+C reaches the whole process
    // group, and this process exits on the stop sentinel instead.
    if let Err(err) = ctrlc::set_handler(|| {}) {
        debug!("Failed to install Ctrl+C handler: {err}");
    }

    let settings = EncodeSettings {
        format: args.format,
        quality: args.quality,
    };
    let served = worker::serve_encoder(io::stdin().lock(), io::stdout().lock(), settings)
        .context("Encoder worker protocol failure")?;
    debug!(served, "Encoder worker exiting");
    Ok(())
}
