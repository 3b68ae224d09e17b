//! dc-offload - compression offload self-test and metrics server
//!
//! Brings up an accelerator pool on the emulated device, drives a mixed
//! workload through it and reports the engine statistics.
//!
//! ```text
//! dc-offload selftest --blocks 512
//! dc-offload serve --metrics-addr 0.0.0.0:9100
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dedupe_offload::accel::emulated::{EmulatedAccelerator, EmulatedConfig};
use dedupe_offload::{
    AcceleratorPool, Continuation, DataVio, DmaBuf, OffloadConfig, OffloadMetrics, ReadStatus,
    SoftwareCodec, SubmitError,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Compression offload engine for block deduplication
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "OFFLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Instances exposed by the emulated accelerator
    #[arg(long, env = "EMULATED_INSTANCES", default_value = "4")]
    instances: usize,

    /// Cap on channels taken from the device
    #[arg(long, env = "MAX_CHANNELS")]
    max_channels: Option<usize>,

    /// Deflate level (1-9)
    #[arg(long, env = "COMPRESSION_LEVEL")]
    level: Option<u32>,

    /// Byte cap on contiguous allocations
    #[arg(long, env = "MEMORY_LIMIT")]
    memory_limit: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a mixed workload and print statistics as JSON
    Selftest {
        /// Number of blocks to write and read back
        #[arg(long, default_value = "256")]
        blocks: usize,
    },

    /// Run the workload periodically and serve /metrics and /healthz
    Serve {
        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9100")]
        metrics_addr: String,

        /// Health server bind address
        #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:9101")]
        health_addr: String,

        /// Blocks per workload round
        #[arg(long, default_value = "64")]
        blocks: usize,

        /// Seconds between workload rounds
        #[arg(long, default_value = "10")]
        interval_seconds: u64,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    info!("Starting dc-offload {}", dedupe_offload::version());
    info!("  Emulated instances: {}", args.instances);
    info!("  Max channels: {}", config.max_channels);
    info!("  Compression level: {}", config.compression_level);

    let accel = Arc::new(EmulatedAccelerator::new(EmulatedConfig {
        instances: args.instances,
        ..Default::default()
    }));
    let pool = Arc::new(AcceleratorPool::initialize(accel, config.clone()));
    if let Some(reason) = pool.init_error() {
        warn!("Offload unavailable, using software codec: {}", reason);
    }
    let codec = SoftwareCodec::new(config.compression_level, config.block_size);

    match args.command {
        Command::Selftest { blocks } => {
            let report = run_workload(&pool, &codec, blocks).await?;
            let output = serde_json::json!({
                "workload": report,
                "stats": pool.stats().snapshot(),
                "allocator": pool.allocator().snapshot(),
                "channel_jobs": pool.channel_jobs(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            if report.mismatches > 0 {
                bail!("{} blocks failed to round-trip", report.mismatches);
            }
        }
        Command::Serve {
            metrics_addr,
            health_addr,
            blocks,
            interval_seconds,
        } => {
            let metrics = Arc::new(OffloadMetrics::new()?);
            metrics.update(&pool);

            let servers = futures::future::try_join(
                run_health_server(health_addr, Arc::clone(&pool)),
                run_metrics_server(metrics_addr, Arc::clone(&pool), Arc::clone(&metrics)),
            );
            tokio::spawn(async move {
                if let Err(e) = servers.await {
                    error!("HTTP server error: {:#}", e);
                }
            });

            let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = run_workload(&pool, &codec, blocks).await?;
                        info!(
                            compressed = report.compressed,
                            incompressible = report.incompressible,
                            fallback = report.software_fallback,
                            "workload round complete"
                        );
                        metrics.update(&pool);
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown requested");
                        break;
                    }
                }
            }
        }
    }

    let pool_for_shutdown = Arc::clone(&pool);
    tokio::task::spawn_blocking(move || pool_for_shutdown.shutdown()).await?;
    info!("dc-offload shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<OffloadConfig> {
    let mut config = match &args.config {
        Some(path) => OffloadConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OffloadConfig::default(),
    };
    if let Some(max_channels) = args.max_channels {
        config.max_channels = max_channels;
    }
    if let Some(level) = args.level {
        config.compression_level = level;
    }
    if args.memory_limit.is_some() {
        config.memory_limit = args.memory_limit;
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Workload
// =============================================================================

#[derive(Debug, Default, Serialize)]
struct WorkloadReport {
    blocks: usize,
    compressed: usize,
    incompressible: usize,
    software_fallback: usize,
    round_trips_verified: usize,
    mismatches: usize,
}

/// Even blocks are repetitive text, odd blocks are pseudo-random.
fn make_block(index: usize, block_size: usize) -> Vec<u8> {
    if index % 2 == 0 {
        let line = format!("block {:08} of the dedupe offload self-test. ", index);
        line.bytes().cycle().take(block_size).collect()
    } else {
        let mut x = (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        (0..block_size)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect()
    }
}

async fn run_workload(
    pool: &AcceleratorPool,
    codec: &SoftwareCodec,
    blocks: usize,
) -> anyhow::Result<WorkloadReport> {
    let block_size = pool.config().block_size;
    let mut report = WorkloadReport {
        blocks,
        ..Default::default()
    };

    // Writes
    let (tx, mut rx) = mpsc::unbounded_channel();
    for i in 0..blocks {
        let data = DmaBuf::from_slice(&make_block(i, block_size))?;
        let vio = DataVio::for_write(i as u64, data, Continuation::Queue(tx.clone()))?;
        match pool.compress(vio) {
            Ok(()) | Err(SubmitError::Failed(_)) => {}
            Err(SubmitError::Unavailable(vio)) => {
                report.software_fallback += 1;
                let mut vio = *vio;
                codec.compress_vio(&mut vio)?;
                vio.enqueue_callback();
            }
        }
    }
    drop(tx);

    let mut written = Vec::with_capacity(blocks);
    while let Some(vio) = rx.recv().await {
        written.push(vio);
    }

    // Read back every compressed block
    let (tx, mut rx) = mpsc::unbounded_channel();
    for vio in &written {
        let Some(envelope) = vio.compressed_data() else {
            report.incompressible += 1;
            continue;
        };
        report.compressed += 1;

        let mut stored = DmaBuf::new(block_size)?;
        stored[..envelope.len()].copy_from_slice(envelope);
        let read = DataVio::for_read(
            vio.id(),
            stored,
            0..envelope.len(),
            block_size,
            Continuation::Queue(tx.clone()),
        )?;
        match pool.decompress(read) {
            Ok(()) | Err(SubmitError::Failed(_)) => {}
            Err(SubmitError::Unavailable(read)) => {
                let mut read = *read;
                codec.decompress_vio(&mut read)?;
                read.enqueue_callback();
            }
        }
    }
    drop(tx);

    while let Some(read) = rx.recv().await {
        let expected = make_block(read.id() as usize, block_size);
        match (read.read_block().status, read.read_data()) {
            (ReadStatus::Success, Some(data)) if data == expected.as_slice() => {
                report.round_trips_verified += 1;
            }
            _ => {
                warn!(vio = read.id(), "read-back mismatch");
                report.mismatches += 1;
            }
        }
    }

    Ok(report)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = ["hyper=warn", "tower=warn"]
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: String, pool: Arc<AcceleratorPool>) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse().context("invalid health server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind health server")?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("health server accept")?;
        let io = TokioIo::new(stream);
        let pool = Arc::clone(&pool);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let pool = Arc::clone(&pool);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if pool.is_ready() => text_response(StatusCode::OK, "ready"),
                        "/readyz" => text_response(
                            StatusCode::SERVICE_UNAVAILABLE,
                            format!("offload {}", pool.state()),
                        ),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: String,
    pool: Arc<AcceleratorPool>,
    metrics: Arc<OffloadMetrics>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse().context("invalid metrics server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);
        let pool = Arc::clone(&pool);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let pool = Arc::clone(&pool);
                let metrics = Arc::clone(&metrics);
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            metrics.update(&pool);
                            match metrics.encode() {
                                Ok(body) => {
                                    let mut response = text_response(StatusCode::OK, body);
                                    response.headers_mut().insert(
                                        CONTENT_TYPE,
                                        HeaderValue::from_static(metrics.content_type()),
                                    );
                                    response
                                }
                                Err(e) => text_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    e.to_string(),
                                ),
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
