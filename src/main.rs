//! shim-logger binary
//!
//! Forwards one container's stdout and stderr pipes to a log collector.

use clap::Parser;
use shim_logger::config::ShimConfig;
use shim_logger::pipeline::{LogReporter, Mode, PipeSet, Pipeline};
use shim_logger::sink::UnixSocketSink;
use shim_logger::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shim-logger")]
#[command(about = "Forwards container stdout/stderr pipes to a log collector")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Container id
    #[arg(long)]
    container_id: Option<String>,

    /// Container name
    #[arg(long)]
    container_name: Option<String>,

    /// Delivery mode: blocking or non-blocking
    #[arg(long)]
    mode: Option<Mode>,

    /// Ring buffer capacity in non-blocking mode, e.g. 1m
    #[arg(long)]
    max_buffer_size: Option<String>,

    /// Grace period before exiting, e.g. 5s
    #[arg(long)]
    cleanup_time: Option<String>,

    /// Container stdout FIFO
    #[arg(long)]
    stdout_pipe: Option<PathBuf>,

    /// Container stderr FIFO
    #[arg(long)]
    stderr_pipe: Option<PathBuf>,

    /// File created once logging is running
    #[arg(long)]
    ready_file: Option<PathBuf>,

    /// Collector socket path
    #[arg(short, long)]
    socket: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::new(if verbose {
        "shim_logger=debug,routing=info"
    } else {
        "shim_logger=info,routing=info"
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    #[cfg(feature = "journald")]
    match tracing_journald::layer() {
        Ok(journald) => registry.with(journald).try_init()?,
        Err(e) => {
            registry.try_init()?;
            warn!("journald is unavailable, logging to stderr only: {}", e);
        }
    }

    #[cfg(not(feature = "journald"))]
    registry.try_init()?;

    Ok(())
}

fn load_config(args: &Args) -> Result<ShimConfig> {
    let mut config = match &args.config {
        Some(path) => ShimConfig::load(path)?,
        None => {
            info!("No config file given, using defaults");
            ShimConfig::default()
        }
    };

    // Override config with CLI arguments
    if let Some(id) = &args.container_id {
        config.container.id = id.clone();
    }
    if let Some(name) = &args.container_name {
        config.container.name = name.clone();
    }
    if let Some(mode) = args.mode {
        config.pipeline.mode = mode;
    }
    if let Some(size) = &args.max_buffer_size {
        config.pipeline.max_buffer_size = size.clone();
    }
    if let Some(cleanup) = &args.cleanup_time {
        config.pipeline.cleanup_time = cleanup.clone();
    }
    if let Some(socket) = &args.socket {
        config.sink.socket_path = socket.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn open_pipe(path: &Path) -> Result<tokio::fs::File> {
    // opening a FIFO blocks until the writer side is open
    let file = tokio::fs::File::open(path).await?;
    info!("Opened pipe {}", path.display());
    Ok(file)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let options = config.pipeline_options()?;
    let cleanup = config.cleanup_duration()?;

    info!("Configuration loaded successfully");
    info!("Container: {} ({})", config.container.name, config.container.id);

    let mut pipes = PipeSet::new();
    if let Some(path) = &args.stdout_pipe {
        pipes = pipes.with_stdout(open_pipe(path).await?);
    }
    if let Some(path) = &args.stderr_pipe {
        pipes = pipes.with_stderr(open_pipe(path).await?);
    }

    let sink = UnixSocketSink::from_settings(&config.sink, &config.container.id, &config.container.name);
    info!("Collector socket: {}", sink.socket_path());
    let pipeline = Pipeline::new(pipes, sink, options)
        .with_reporter(Arc::new(LogReporter::new(&config.container.id)));
    info!(
        "Mode: {}, max buffer size: {} bytes",
        pipeline.options().mode,
        pipeline.options().max_buffer_size
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                on_signal.cancel();
            }
            Err(e) => warn!("Failed to install CTRL+C signal handler: {}", e),
        }
    });

    let ready_file = args.ready_file.clone();
    pipeline
        .start(cancel, cleanup, move || {
            if let Some(path) = ready_file {
                std::fs::write(&path, b"ready")?;
            }
            info!("Container logging is ready");
            Ok(())
        })
        .await
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    info!("Starting shim-logger v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => info!("shim-logger stopped"),
        Err(e) if e.is_fatal() => {
            error!("shim-logger failed: {}", e);
            std::process::exit(1);
        }
        Err(e) => warn!("shim-logger stopped with a logging failure: {}", e),
    }

    Ok(())
}
