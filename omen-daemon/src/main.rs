//! Omenfan Daemon (omenfand)
//!
//! Privileged service that owns the hardware backend: identifies the
//! model, applies the configured thermal profile and power limits, then
//! polls telemetry and follows fan curves until told to stop. On SIGINT or
//! SIGTERM the fans are handed back to firmware control before exit.

mod runtime;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use omenfan::calibration::{sweep, SweepConfig};
use omenfan::data::BackendKind;
use omenfan::engine::TokioClock;
use omenfan::settings::AppSettings;

use crate::runtime::Runtime;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendChoice {
    Auto,
    SignedModule,
    DirectDriver,
}

impl BackendChoice {
    fn forced(self) -> Option<BackendKind> {
        match self {
            Self::Auto => None,
            Self::SignedModule => Some(BackendKind::SignedModule),
            Self::DirectDriver => Some(BackendKind::DirectDriver),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "omenfand")]
#[command(version)]
#[command(about = "Omenfan - fan, thermal and power control daemon for HP OMEN machines")]
struct Cli {
    /// Settings file (default: $OMENFAN_CONFIG_DIR or ~/.config/omenfan/settings.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Register backend to use
    #[arg(short, long, value_enum, default_value_t = BackendChoice::Auto)]
    backend: BackendChoice,

    /// Log filter, e.g. "debug" or "omenfan=trace" (overrides RUST_LOG)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print one telemetry snapshot as JSON and exit
    #[arg(long)]
    once: bool,

    /// Measure one fan channel and store its calibration table
    #[arg(long, value_name = "CHANNEL", conflicts_with = "once")]
    calibrate: Option<u8>,

    /// Set CHANNEL to PERCENT with read-back verification, then exit
    #[arg(long, num_args = 2, value_names = ["CHANNEL", "PERCENT"], conflicts_with_all = ["once", "calibrate"])]
    set_duty: Option<Vec<u8>>,
}

// ============================================================================
// Logging
// ============================================================================

/// Journald when systemd is present, otherwise formatted stdout
fn init_logging(level: Option<&str>) -> bool {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if std::path::Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald) => {
                tracing_subscriber::registry().with(journald).with(filter).init();
                return true;
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stdout", e),
        }
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
    false
}

fn load_settings(path: Option<&PathBuf>) -> AppSettings {
    let path = path.cloned().unwrap_or_else(AppSettings::path);
    match AppSettings::load_from(&path) {
        Ok(settings) => {
            info!(path = %path.display(), "Settings loaded");
            settings
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Settings unusable; continuing with defaults");
            AppSettings::default()
        }
    }
}

// ============================================================================
// Signals
// ============================================================================

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = term.recv() => info!("SIGTERM received"),
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; waiting for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Interrupt received");
}

/// Cancel `token` on the first shutdown signal
fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    })
}

// ============================================================================
// Modes
// ============================================================================

async fn run_once(rt: &Runtime) -> Result<()> {
    let engine = rt.engine.clone();
    let snapshot = tokio::task::spawn_blocking(move || engine.read_telemetry()).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run_calibration(rt: &Runtime, channel: u8, cancel: &CancellationToken) -> Result<()> {
    let table = sweep(rt.engine.as_ref(), &rt.gate, &TokioClock, channel, &SweepConfig::default(), cancel).await?;
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    {
        let mut store = rt.calibration.write();
        store.upsert_channel(&rt.model_key, table, now_ms);
        store.save(&rt.calibration_path)?;
    }
    for summary in rt.calibration.read().summaries() {
        println!(
            "{} channel {}: {} points, {}-{} RPM",
            summary.model_key, summary.channel_index, summary.point_count, summary.min_rpm, summary.max_rpm
        );
    }
    Ok(())
}

async fn run_set_duty(rt: &Runtime, channel: u8, percent: u8, cancel: &CancellationToken) -> Result<()> {
    let result = rt.verifier().apply(channel, percent, cancel).await?;
    println!("{}", result.summary());
    Ok(())
}

async fn run_service(rt: &Runtime, cancel: CancellationToken) {
    let poller = rt.poller();
    tokio::select! {
        _ = poller.run(cancel.clone()) => {}
        _ = shutdown_signal() => cancel.cancel(),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let journald = init_logging(cli.log_level.as_deref());

    info!("STARTUP: omenfand {} starting", VERSION);
    info!("STARTUP: Logging to {}", if journald { "systemd journal" } else { "stdout" });

    let settings = load_settings(cli.config.as_ref());
    let apply_on_startup = settings.general.apply_on_startup;
    let rt = Runtime::build(settings, cli.backend.forced())?;
    rt.report_backend();

    let cancel = CancellationToken::new();
    let outcome = if cli.once {
        run_once(&rt).await
    } else if let Some(channel) = cli.calibrate {
        let watcher = cancel_on_signal(cancel.clone());
        let r = run_calibration(&rt, channel, &cancel).await;
        watcher.abort();
        r
    } else if let Some(args) = cli.set_duty.as_deref() {
        let watcher = cancel_on_signal(cancel.clone());
        let r = match args {
            [channel, percent] => run_set_duty(&rt, *channel, *percent, &cancel).await,
            _ => Err(anyhow::anyhow!("--set-duty takes CHANNEL and PERCENT")),
        };
        watcher.abort();
        r
    } else {
        if apply_on_startup {
            if let Err(e) = rt.apply_startup() {
                warn!(error = %e, "Startup settings not fully applied");
            }
        }
        run_service(&rt, cancel.clone()).await;
        Ok(())
    };

    info!("SHUTDOWN: Restoring firmware fan control");
    rt.shutdown().await;
    info!("SHUTDOWN: omenfand stopped");
    outcome
}
