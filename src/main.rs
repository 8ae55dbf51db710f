//! # Param Sync
//!
//! Demonstrates the parameter synchronization engine against a simulated
//! ArduCopter-style flight controller.
//!
//! The run fetches the full table, writes one parameter, saves a staged
//! edit and prints the resulting cache as JSON lines on stdout.

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use param_sync::cache::{Parameter, Snapshot};
use param_sync::config::{Config, LinkConfig, LoggingConfig};
use param_sync::engine::{FetchOutcome, ParamEngine};
use param_sync::metadata::{MetadataProvider, NoMetadata, PdefCatalog};
use param_sync::protocol::ParamType;
use param_sync::transport::{memory_link, SimulatedDevice};

/// Frames buffered in each direction of the in-memory link
const LINK_CAPACITY: usize = 256;

/// Parameter written by the demo
const DEMO_WRITE: (&str, f32, ParamType) = ("ANGLE_MAX", 3000.0, ParamType::Int16);

/// Local edit staged and saved by the demo
const DEMO_EDIT: (&str, f32) = ("RC1_MIN", 1100.0);

/// Main entry point for Param Sync
///
/// # Control Flow
///
/// 1. Load configuration from the path given as the first argument, or use
///    defaults
/// 2. Set up logging (stderr, plus a rolling file when configured)
/// 3. Start the simulated device and the engine on an in-memory link
/// 4. Fetch, write, save, print
///
/// Ctrl+C stops the run early.
///
/// # Examples
///
/// ```bash
/// cargo run --release -- config/default.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            Config::load(&path).with_context(|| format!("Failed to load config from {}", path))?
        }
        None => Config::default(),
    };

    let _log_guard = init_logging(&config.logging)?;
    info!("Param Sync v{} starting...", env!("CARGO_PKG_VERSION"));

    let metadata: Arc<dyn MetadataProvider> = match &config.metadata.catalog_path {
        Some(path) => Arc::new(PdefCatalog::new(path)),
        None => Arc::new(NoMetadata),
    };

    let (transport, inbound, device_end) = memory_link(LINK_CAPACITY);
    let sim = demo_device(&config.link).spawn(device_end);
    let engine = ParamEngine::new(&config, Arc::new(transport), inbound, metadata);

    tokio::select! {
        result = run_demo(&engine) => {
            let snapshot = result?;
            print_snapshot(&snapshot)?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    engine.shutdown();
    sim.stop();
    Ok(())
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer when dropped, so it must live
/// until exit.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let level: tracing::Level = config
        .level
        .parse()
        .with_context(|| format!("Invalid log level {}", config.level))?;
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Small ArduCopter-like parameter table
fn demo_device(link: &LinkConfig) -> SimulatedDevice {
    SimulatedDevice::new(link.target())
        .with_param("FRAME_CLASS", 1.0, ParamType::Int8)
        .with_param("FRAME_TYPE", 1.0, ParamType::Int8)
        .with_param("ANGLE_MAX", 4500.0, ParamType::Int16)
        .with_param("ATC_RAT_RLL_P", 0.135, ParamType::Real32)
        .with_param("ATC_RAT_PIT_P", 0.135, ParamType::Real32)
        .with_param("RC1_MIN", 1000.0, ParamType::Int16)
        .with_param("RC1_MAX", 2000.0, ParamType::Int16)
        .with_param("SERVO1_FUNCTION", 33.0, ParamType::Int16)
        .with_param("SERVO2_FUNCTION", 34.0, ParamType::Int16)
        .with_param("BATT_CAPACITY", 3300.0, ParamType::Int32)
        .with_param("SERIAL1_PROTOCOL", 2.0, ParamType::Int8)
}

async fn run_demo(engine: &ParamEngine) -> Result<Snapshot> {
    let report = engine.fetch_all(false).await?;
    match &report.outcome {
        FetchOutcome::Complete { count } => info!("Fetched all {} parameters", count),
        FetchOutcome::Partial { missing, .. } => {
            warn!("Fetch incomplete, {} parameters missing", missing.len())
        }
        FetchOutcome::Cancelled { received } => warn!("Fetch cancelled after {}", received),
    }
    debug!("Fetch outcome: {}", serde_json::to_string(&report.outcome)?);

    let (name, value, param_type) = DEMO_WRITE;
    let param = engine.set(name, value, param_type, false).await?;
    info!("{} is now {}", param.display_name(), param.display_value());

    let (name, value) = DEMO_EDIT;
    if engine.cache().stage_edit(name, value).is_some() {
        for (name, result) in engine.save_dirty().await {
            match result {
                Ok(param) => info!("Saved {} = {}", name, param.display_value()),
                Err(e) => warn!("Could not save {}: {}", name, e),
            }
        }
    }

    Ok(engine.snapshot())
}

/// Entries in table order
fn table_order(snapshot: &Snapshot) -> Vec<&Parameter> {
    let mut params: Vec<&Parameter> = snapshot.values().collect();
    params.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
    params
}

fn print_snapshot(snapshot: &Snapshot) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for param in table_order(snapshot) {
        serde_json::to_writer(&mut stdout, param)?;
        writeln!(stdout)?;
    }
    stdout.flush()?;
    Ok(())
}
