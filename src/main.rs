//! BLE Sensor Agent CLI
//!
//! Beacon proximity sensor with durable remote delivery.

use anyhow::{bail, Context, Result};
use ble_sensor_agent::{
    config::Config,
    delivery::CheckpointStore,
    pipeline::{build_delivery_stage, PipelineError, PipelineReport, PipelineSupervisor},
    scanner::{NoopScanner, ReplayScanner, Scanner},
    stats::{create_shared_stats_with_persistence, load_persisted, SharedStats},
    VERSION,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ble-sensor")]
#[command(version = VERSION)]
#[command(about = "BLE beacon sensor with durable remote delivery", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start scanning and delivering windows
    Start {
        /// Sighting source: a JSON-lines file, "-" for stdin, or "none"
        #[arg(long, default_value = "-")]
        source: String,

        /// Override the aggregation period (seconds)
        #[arg(long)]
        period: Option<f64>,

        /// Override the remote endpoint
        #[arg(long)]
        endpoint: Option<String>,

        /// Override the local checkpoint directory
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Do not retry retained checkpoints before starting
        #[arg(long)]
        no_retry: bool,
    },

    /// Re-deliver checkpoints left by earlier runs, then exit
    Retry {
        /// Override the remote endpoint
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Show configuration, retained checkpoints and cumulative statistics
    Status,

    /// Show configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Config::config_path);
    let result = match cli.command {
        Commands::Start {
            source,
            period,
            endpoint,
            checkpoint_dir,
            no_retry,
        } => load_config(&config_path).and_then(|mut config| {
            if let Some(period) = period {
                config.aggregation_period_seconds = period;
            }
            if endpoint.is_some() {
                config.remote_endpoint = endpoint;
            }
            if let Some(dir) = checkpoint_dir {
                config.local_checkpoint_dir = dir;
            }
            if no_retry {
                config.retry_pending_on_start = false;
            }
            cmd_start(&config, &source)
        }),
        Commands::Retry { endpoint } => load_config(&config_path).and_then(|mut config| {
            if endpoint.is_some() {
                config.remote_endpoint = endpoint;
            }
            cmd_retry(&config)
        }),
        Commands::Status => load_config(&config_path).and_then(|config| cmd_status(&config)),
        Commands::Config { init } => {
            load_config(&config_path).and_then(|config| cmd_config(&config, &config_path, init))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Structured logging, level from `RUST_LOG` (default info).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load_from(path).with_context(|| format!("loading {}", path.display()))
}

fn shared_stats(config: &Config) -> SharedStats {
    create_shared_stats_with_persistence(config.stats_path())
}

fn cmd_start(config: &Config, source: &str) -> Result<()> {
    info!(version = VERSION, sensor_id = %config.sensor_id, "BLE sensor agent starting");

    if let Err(e) = config.ensure_directories() {
        warn!(error = %e, "could not create data directories");
    }

    let stats = shared_stats(config);
    let report = match source {
        "none" => run_pipeline(config, NoopScanner::new(), stats.clone()),
        "-" => run_pipeline(config, ReplayScanner::stdin(), stats.clone()),
        path => {
            let scanner = ReplayScanner::from_path(Path::new(path))
                .map_err(PipelineError::Scanner)
                .context("opening sighting source")?;
            run_pipeline(config, scanner, stats.clone())
        }
    };

    if let Err(e) = stats.save() {
        warn!(error = %e, "could not save pipeline stats");
    }

    let report = report?;
    println!();
    println!("{}", report.stats);
    if report.pending_checkpoints > 0 {
        println!(
            "{} window(s) retained in {}; run 'ble-sensor retry' once the store is reachable.",
            report.pending_checkpoints,
            config.local_checkpoint_dir.display()
        );
    }
    Ok(())
}

fn run_pipeline<S: Scanner>(config: &Config, scanner: S, stats: SharedStats) -> Result<PipelineReport> {
    let supervisor =
        PipelineSupervisor::from_config(config, scanner, stats).context("building pipeline")?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("setting Ctrl+C handler")?;

    info!("press Ctrl+C to stop");
    let report = supervisor.run(stop_rx).context("pipeline stopped")?;
    info!(
        delivered = report.stats.batches_delivered,
        pending = report.pending_checkpoints,
        "pipeline shut down"
    );
    Ok(report)
}

fn cmd_retry(config: &Config) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let stats = shared_stats(config);
    let stage = build_delivery_stage(config, stats.clone()).context("building delivery stage")?;

    if let Err(e) = stage.transport().health_check() {
        warn!(transport = %stage.transport().describe(), error = %e, "remote store health check failed");
    }

    let report = stage
        .retry_pending()
        .with_context(|| format!("reading {}", config.local_checkpoint_dir.display()))?;

    if let Err(e) = stats.save() {
        warn!(error = %e, "could not save pipeline stats");
    }

    println!(
        "Delivered {} window(s), {} still pending.",
        report.delivered, report.remaining
    );
    if report.failed > 0 {
        bail!("remote store rejected a retained window; {} left for next time", report.remaining);
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("BLE Sensor Agent Status");
    println!("=======================");
    println!();

    println!("Configuration:");
    println!("  Sensor ID: {}", config.sensor_id);
    println!(
        "  Remote endpoint: {}",
        config.remote_endpoint.as_deref().unwrap_or("(not set)")
    );
    println!("  Aggregation period: {}s", config.aggregation_period_seconds);
    println!(
        "  Distance model: A={} dBm, n={}",
        config.scan_calibration_a, config.scan_path_loss_n
    );
    if let Err(e) = config.validate() {
        println!("  Problem: {e}");
    }
    println!();

    let pending = CheckpointStore::inspect(&config.local_checkpoint_dir)
        .pending()
        .unwrap_or_default();
    println!("Retained checkpoints: {}", pending.len());
    if let (Some(oldest), Some(newest)) = (pending.first(), pending.last()) {
        println!("  Oldest window: {}", oldest.label);
        println!("  Newest window: {}", newest.label);
    }
    println!();

    match load_persisted(&config.stats_path()) {
        Ok(stats) => {
            println!("Cumulative Statistics (as of {}):", stats.last_updated);
            println!("  Sightings received: {}", stats.sightings_received);
            println!("  Sensor faults: {}", stats.sensor_faults);
            println!("  Windows flushed: {}", stats.windows_flushed);
            println!("  Batches delivered: {}", stats.batches_delivered);
            println!("  Delivery failures: {}", stats.delivery_failures);
            println!("  Batches lost: {}", stats.batches_lost);
        }
        Err(_) => println!("No previous session data found."),
    }
    Ok(())
}

fn cmd_config(config: &Config, path: &Path, init: bool) -> Result<()> {
    if init {
        config
            .save_to(path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    let mut shown = config.clone();
    if shown.remote_credentials.is_some() {
        shown.remote_credentials = Some("********".to_string());
    }

    println!("Configuration file: {}", path.display());
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}
