//! Media bridge decoder process
//!
//! Spawned by the host with the session's namespace directory and the
//! stream length. Registers on the control channel, pulls the stream over
//! the data channel, and publishes decoded NV12 frames as sealed memory
//! buffers until the host goes away.

mod control;
mod pipeline;
mod ring;
mod session;
mod source;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mb_protocol::NamespaceLayout;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use control::DecoderControl;
use pipeline::Y4mPipeline;
use session::DecoderLoop;
use source::{DataReader, DataSource};

/// Decoder process for the media bridge
#[derive(Parser, Debug)]
#[command(name = "mb-decoder")]
#[command(about = "Decodes a host-served stream into shareable frame buffers")]
#[command(version)]
struct Args {
    /// Session directory holding the host and decoder endpoints
    namespace: PathBuf,

    /// Length of the served stream in bytes
    stream_size: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Control channel poll interval in milliseconds
    #[arg(long, default_value = "10")]
    poll_ms: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout belongs to nobody; the host inherits our stderr
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!(
        "mb-decoder v{} (pid {}) serving {}",
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        args.namespace.display()
    );

    if let Err(e) = run(&args) {
        error!("Decoder failed: {:#}", e);
        return Err(e);
    }

    info!("Decoder exiting");
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<()> {
    let layout = NamespaceLayout::new(&args.namespace);

    let control = DecoderControl::register(&layout)
        .with_context(|| format!("failed to register with host in {}", layout.dir().display()))?;

    let reader = DataReader::spawn(DataSource::new(layout.data(), args.stream_size))
        .context("failed to start data reader")?;
    let pipeline = Y4mPipeline::new(reader);

    DecoderLoop::new(control, pipeline, Duration::from_millis(args.poll_ms.max(1))).run()
}
