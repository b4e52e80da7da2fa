#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # pmu-ingest
//!
//! Receiver for data files uploaded by phasor measurement units (PMUs).
//!
//! Each PMU keeps a TCP connection open and sends one frame per data file.
//! The receiver persists the file, records the device's latest contact time,
//! and acknowledges the frame by echoing its 4-byte `send_id`, or four zero
//! bytes if it could not be stored.
//!
//! ## Subcommands
//!
//! - `pmu-ingest serve` (default) — run the receiver
//! - `pmu-ingest simulate --target <addr>` — run virtual PMUs against a receiver
//!
//! ## Wire format
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | `send_id`                               |
//! | 4      | 4    | file path length (u32 LE, ≤ 512)        |
//! | 8      | 4    | serial number length (u32 LE, ≤ 32)     |
//! | 12     | 4    | data length (u32 LE, ≤ 75 744 000)      |
//! | 16     | …    | file path, zero-padded to a multiple of 4 |
//! | …      | …    | serial number, zero-padded likewise     |
//! | …      | …    | data, unpadded                          |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, backend setup, shutdown
//! config.rs        — TOML + env-var configuration
//! protocol.rs      — wire constants, header validation, frame encoder
//! decoder.rs       — FrameDecoder state machine
//! gate.rs          — AdmissionGate session pool
//! store/
//!   mod.rs         — Record, Session and Store traits
//!   disk.rs        — payload files + JSONL index + latest_times.json
//!   memory.rs      — in-process backend
//! alias.rs         — serial number labels
//! connection.rs    — per-connection loop
//! server.rs        — TCP listener
//! simulator.rs     — virtual PMUs
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use pmu_ingest::alias::{AliasError, AliasTable};
use pmu_ingest::config::{Backend, Config, ConfigError};
use pmu_ingest::gate::AdmissionGate;
use pmu_ingest::protocol::EXPECTED_DATA_LEN;
use pmu_ingest::server::{self, ServerContext};
use pmu_ingest::simulator::{self, SimulatorConfig};
use pmu_ingest::store::disk::DiskStore;
use pmu_ingest::store::memory::MemoryStore;
use pmu_ingest::store::{Store, StoreError};

/// Receiver for PMU data file uploads.
#[derive(Parser)]
#[command(name = "pmu-ingest", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the receiver (default when no subcommand given).
    Serve,
    /// Run virtual PMUs against a receiver.
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// Receiver address, `host:port`.
    #[arg(long)]
    target: String,
    /// Number of virtual PMUs.
    #[arg(long, default_value_t = 1)]
    devices: u32,
    /// Seconds between files of one PMU.
    #[arg(long, default_value_t = 120.0)]
    interval: f64,
    /// Serial number of the first PMU.
    #[arg(long, default_value_t = 1)]
    first_serial: u32,
    /// Bytes of data per file.
    #[arg(long, default_value_t = EXPECTED_DATA_LEN as usize)]
    payload_len: usize,
    /// Stop each PMU after this many acknowledged files.
    #[arg(long)]
    files: Option<u32>,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Aliases(#[from] AliasError),
    #[error("could not open store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid --interval {0}: must be a finite, non-negative number of seconds")]
    Interval(f64),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            // No subscriber yet; config decides the log level.
            eprintln!("pmu-ingest: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = match cli.command {
        Some(Commands::Simulate(args)) => run_simulator(args).await,
        Some(Commands::Serve) | None => run_server(config).await,
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(config: Config) -> Result<(), StartupError> {
    info!("pmu-ingest v{} starting", env!("CARGO_PKG_VERSION"));

    let aliases = match &config.aliases.path {
        Some(path) => AliasTable::load(path)?,
        None => {
            warn!("No alias file configured, all devices will be labelled UNKNOWN");
            AliasTable::default()
        }
    };

    match config.store.backend {
        Backend::Disk => {
            let store = DiskStore::open(&config.store.data_dir, config.store.fsync).await?;
            serve_with(&store, aliases, &config).await
        }
        Backend::Memory => {
            warn!("Using the in-memory store, received files are lost on exit");
            serve_with(&MemoryStore::new(), aliases, &config).await
        }
    }
}

async fn serve_with<St: Store>(
    store: &St,
    aliases: AliasTable,
    config: &Config,
) -> Result<(), StartupError> {
    let gate = AdmissionGate::open(store, config.store.pool_size)?;
    info!("Opened {} persistence sessions", gate.size());

    let ctx = Arc::new(ServerContext {
        aliases,
        gate,
        limits: config.protocol,
        read_buffer_len: config.server.read_buffer_len,
    });

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.server.listen.clone(),
            source,
        })?;
    info!("Listening on {}", config.server.listen);

    server::serve(listener, ctx, shutdown_signal()).await;
    info!("Goodbye");
    Ok(())
}

async fn run_simulator(args: SimulateArgs) -> Result<(), StartupError> {
    let interval = Duration::try_from_secs_f64(args.interval)
        .map_err(|_| StartupError::Interval(args.interval))?;
    info!(
        "Simulating {} PMUs against {}, one file every {}s",
        args.devices, args.target, args.interval
    );

    let config = SimulatorConfig {
        target: args.target,
        devices: args.devices,
        first_serial: args.first_serial,
        interval,
        payload_len: args.payload_len,
        max_files: args.files,
    };
    tokio::select! {
        () = simulator::run(config) => {}
        () = shutdown_signal() => {}
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Could not register SIGTERM handler: {e}");
                ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received SIGINT");
    }
}
