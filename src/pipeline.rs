//! Pipeline supervisor.
//!
//! Runs the observation pipeline on three named threads:
//!
//! ```text
//! Scanner ──▶ scan-feed ──▶ SightingQueue ──▶ aggregator (tick) ──▶ delivery ──▶ remote
//! ```
//!
//! The aggregator never waits on the network: finished batches go over an
//! unbounded channel to the delivery thread. Shutdown stops the feed first,
//! then lets the aggregator drain the queue and flush one final window.

use crate::config::{Config, ConfigError};
use crate::core::distance::DistanceModel;
use crate::core::queue::{sighting_queue, SightingReceiver, SightingSender};
use crate::core::types::{Batch, Sighting};
use crate::core::windowing::Aggregator;
use crate::delivery::{transport_from_config, CheckpointStore, DeliveryStage, TransportError};
use crate::scanner::{ScanEvent, Scanner, ScannerError};
use crate::stats::{SharedStats, StatsSnapshot};
use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SCAN_FEED: &str = "scan-feed";
const AGGREGATOR: &str = "aggregator";
const DELIVERY: &str = "delivery";

/// Settings the supervisor needs from the full configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Aggregation window length
    pub period: Duration,
    /// How long shutdown waits for the delivery thread
    pub final_delivery_timeout: Duration,
    /// Applied to every sighting and window mean
    pub model: DistanceModel,
    /// Re-deliver leftover checkpoints once the scanner is up
    pub retry_pending_on_start: bool,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            period: config.aggregation_period(),
            final_delivery_timeout: config.final_delivery_timeout(),
            model: config.distance_model(),
            retry_pending_on_start: config.retry_pending_on_start,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(750),
            final_delivery_timeout: Duration::from_secs(10),
            model: DistanceModel::default(),
            retry_pending_on_start: true,
        }
    }
}

/// Errors that stop the whole pipeline.
#[derive(Debug)]
pub enum PipelineError {
    /// Configuration invalid
    Config(ConfigError),
    /// Scanner could not be started
    Scanner(ScannerError),
    /// Remote transport could not be set up
    Transport(TransportError),
    /// Checkpoint directory unusable
    Checkpoint(String),
    /// A worker thread could not be spawned
    Spawn(String),
    /// A worker thread panicked or quit before shutdown
    WorkerExited(&'static str),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "{e}"),
            PipelineError::Scanner(e) => write!(f, "{e}"),
            PipelineError::Transport(e) => write!(f, "{e}"),
            PipelineError::Checkpoint(e) => write!(f, "Checkpoint directory error: {e}"),
            PipelineError::Spawn(e) => write!(f, "Failed to spawn worker: {e}"),
            PipelineError::WorkerExited(name) => {
                write!(f, "Pipeline worker '{name}' exited unexpectedly")
            }
        }
    }
}

impl std::error::Error for PipelineError {}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub stats: StatsSnapshot,
    /// False if shutdown gave up waiting for the delivery thread
    pub delivery_completed: bool,
    /// Checkpoints left on disk for a later retry
    pub pending_checkpoints: usize,
}

/// Build the delivery stage described by the configuration.
pub fn build_delivery_stage(
    config: &Config,
    stats: SharedStats,
) -> Result<DeliveryStage, PipelineError> {
    let store = CheckpointStore::open(&config.local_checkpoint_dir).map_err(|e| {
        PipelineError::Checkpoint(format!("{}: {e}", config.local_checkpoint_dir.display()))
    })?;
    let transport = transport_from_config(config).map_err(PipelineError::Transport)?;
    Ok(DeliveryStage::new(
        store,
        transport,
        config.remote_dir.clone(),
        stats,
    ))
}

/// Owns the scanner and the delivery stage for the lifetime of a run.
pub struct PipelineSupervisor<S: Scanner> {
    config: PipelineConfig,
    scanner: S,
    stage: DeliveryStage,
    stats: SharedStats,
}

impl<S: Scanner> PipelineSupervisor<S> {
    pub fn new(config: PipelineConfig, scanner: S, stage: DeliveryStage, stats: SharedStats) -> Self {
        Self {
            config,
            scanner,
            stage,
            stats,
        }
    }

    /// Validate the configuration and build everything the run needs.
    pub fn from_config(config: &Config, scanner: S, stats: SharedStats) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        let stage = build_delivery_stage(config, stats.clone())?;
        Ok(Self::new(
            PipelineConfig::from_config(config),
            scanner,
            stage,
            stats,
        ))
    }

    /// Run until `stop` receives a message or disconnects, the scanner runs
    /// dry, or a worker dies.
    pub fn run(self, stop: Receiver<()>) -> Result<PipelineReport, PipelineError> {
        let Self {
            config,
            mut scanner,
            stage,
            stats,
        } = self;

        // A missing radio is fatal before any upload work starts. Events
        // buffer in the scanner channel while retained windows are retried.
        scanner.start().map_err(PipelineError::Scanner)?;

        if let Err(e) = stage.transport().health_check() {
            warn!(transport = %stage.transport().describe(), error = %e, "remote store not reachable yet");
        }
        if config.retry_pending_on_start {
            match stage.retry_pending() {
                Ok(report) if report.delivered + report.failed > 0 => info!(
                    delivered = report.delivered,
                    remaining = report.remaining,
                    "retained checkpoints retried"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "could not list retained checkpoints"),
            }
        }

        info!(
            period_ms = config.period.as_millis() as u64,
            transport = %stage.transport().describe(),
            "pipeline started"
        );

        let store = stage.store().clone();
        let (exit_tx, exit_rx) = unbounded();

        let workers = match start_workers(&config, &scanner, stage, &stats, &exit_tx) {
            Ok(workers) => workers,
            Err(e) => {
                scanner.stop();
                return Err(e);
            }
        };

        let mut outcome = Ok(());
        select! {
            recv(stop) -> _ => info!("stop requested"),
            recv(exit_rx) -> name => match name {
                Ok(SCAN_FEED) => info!("scanner stream ended"),
                Ok(name) => {
                    error!(worker = name, "worker exited before shutdown");
                    outcome = Err(PipelineError::WorkerExited(name));
                }
                Err(_) => {}
            },
        }

        info!("shutting down pipeline");
        scanner.stop();
        let Workers { intake, delivery } = workers;
        if let Err(e) = intake.wind_down() {
            outcome = outcome.and(Err(e));
        }

        let deadline = Instant::now() + config.final_delivery_timeout;
        let delivery_completed = loop {
            match exit_rx.recv_deadline(deadline) {
                Ok(DELIVERY) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        };

        if delivery_completed {
            if delivery.join().is_err() {
                outcome = outcome.and(Err(PipelineError::WorkerExited(DELIVERY)));
            }
        } else {
            warn!(
                timeout_secs = config.final_delivery_timeout.as_secs(),
                "final delivery still in flight, leaving it to the retained checkpoint"
            );
        }

        let pending_checkpoints = store.pending().map(|p| p.len()).unwrap_or(0);
        if pending_checkpoints > 0 {
            warn!(
                pending = pending_checkpoints,
                dir = %store.dir().display(),
                "undelivered windows retained on disk"
            );
        }

        outcome.map(|()| PipelineReport {
            stats: stats.snapshot(),
            delivery_completed,
            pending_checkpoints,
        })
    }
}

struct Workers {
    intake: Intake,
    delivery: JoinHandle<()>,
}

/// The scan feed and the aggregator, each with its own stop channel.
struct Intake {
    feed: JoinHandle<()>,
    aggregator: JoinHandle<()>,
    feed_stop: Sender<()>,
    aggregator_stop: Sender<()>,
}

impl Intake {
    /// Stop the feed and wait for it before the aggregator's final drain, so
    /// every sighting the feed accepted lands in a batch.
    fn wind_down(self) -> Result<(), PipelineError> {
        let Intake {
            feed,
            aggregator,
            feed_stop,
            aggregator_stop,
        } = self;
        let mut outcome = Ok(());

        drop(feed_stop);
        if feed.join().is_err() {
            error!(worker = SCAN_FEED, "worker panicked");
            outcome = Err(PipelineError::WorkerExited(SCAN_FEED));
        }

        drop(aggregator_stop);
        if aggregator.join().is_err() {
            error!(worker = AGGREGATOR, "worker panicked");
            outcome = outcome.and(Err(PipelineError::WorkerExited(AGGREGATOR)));
        }

        outcome
    }
}

/// Tells the supervisor a worker is gone, including by panic.
struct ExitNotice {
    name: &'static str,
    exits: Sender<&'static str>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.exits.send(self.name);
    }
}

fn spawn_worker<F>(
    name: &'static str,
    exits: &Sender<&'static str>,
    work: F,
) -> Result<JoinHandle<()>, PipelineError>
where
    F: FnOnce() + Send + 'static,
{
    let notice = ExitNotice {
        name,
        exits: exits.clone(),
    };
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _notice = notice;
            work();
        })
        .map_err(|e| PipelineError::Spawn(format!("{name}: {e}")))
}

fn start_workers<S: Scanner>(
    config: &PipelineConfig,
    scanner: &S,
    stage: DeliveryStage,
    stats: &SharedStats,
    exits: &Sender<&'static str>,
) -> Result<Workers, PipelineError> {
    let (batch_tx, batch_rx) = unbounded();

    let delivery = spawn_worker(DELIVERY, exits, move || run_delivery(stage, batch_rx))?;
    let intake = spawn_intake(scanner.receiver(), config, stats, batch_tx, exits)?;

    Ok(Workers { intake, delivery })
}

fn spawn_intake(
    events: Receiver<ScanEvent>,
    config: &PipelineConfig,
    stats: &SharedStats,
    batches: Sender<Batch>,
    exits: &Sender<&'static str>,
) -> Result<Intake, PipelineError> {
    let (queue_tx, queue_rx) = sighting_queue();
    let (feed_stop, feed_stopped) = bounded::<()>(0);
    let (aggregator_stop, aggregator_stopped) = bounded::<()>(0);

    let aggregator = {
        let aggregator = Aggregator::new(config.model);
        let stats = stats.clone();
        let period = config.period;
        spawn_worker(AGGREGATOR, exits, move || {
            run_aggregation(aggregator, queue_rx, batches, aggregator_stopped, period, stats)
        })?
    };

    let feed = {
        let model = config.model;
        let stats = stats.clone();
        spawn_worker(SCAN_FEED, exits, move || {
            run_scan_feed(events, queue_tx, model, feed_stopped, stats)
        })?
    };

    Ok(Intake {
        feed,
        aggregator,
        feed_stop,
        aggregator_stop,
    })
}

/// Scanner events to sightings. Never blocks on the queue.
fn run_scan_feed(
    events: Receiver<ScanEvent>,
    queue: SightingSender,
    model: DistanceModel,
    shutdown: Receiver<()>,
    stats: SharedStats,
) {
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(ScanEvent::Advertisement(raw)) => {
                    stats.record_sighting();
                    queue.enqueue(Sighting::from_raw(raw, &model));
                }
                Ok(ScanEvent::Fault(message)) => {
                    stats.record_sensor_fault();
                    warn!(error = %message, "transient sensor error, scanning continues");
                }
                Err(_) => {
                    debug!("scanner event channel closed");
                    break;
                }
            },
            recv(shutdown) -> _ => break,
        }
    }
}

/// Timer-driven window loop. Ticks missed while a flush overruns are
/// coalesced by the ticker, so a slow window skips ahead instead of queueing.
fn run_aggregation(
    mut aggregator: Aggregator,
    queue: SightingReceiver,
    batches: Sender<Batch>,
    shutdown: Receiver<()>,
    period: Duration,
    stats: SharedStats,
) {
    let ticker = tick(period);
    loop {
        select! {
            recv(ticker) -> _ => close_window(&mut aggregator, &queue, &batches, &stats, period),
            recv(shutdown) -> _ => {
                close_window(&mut aggregator, &queue, &batches, &stats, period);
                debug!("final window flushed");
                break;
            }
        }
    }
}

fn close_window(
    aggregator: &mut Aggregator,
    queue: &SightingReceiver,
    batches: &Sender<Batch>,
    stats: &SharedStats,
    period: Duration,
) {
    let started = Instant::now();

    aggregator.ingest_all(queue.drain());
    let samples = aggregator.sample_count();

    match aggregator.flush(Utc::now()) {
        Some(batch) => {
            stats.record_window_flushed();
            debug!(
                window = %batch.label,
                devices = batch.device_count(),
                samples,
                "window closed"
            );
            if let Err(e) = batches.send(batch) {
                error!(window = %e.0.label, devices = e.0.device_count(), "delivery thread gone, window dropped");
            }
        }
        None => {
            stats.record_empty_window();
            debug!("no new sightings this window");
        }
    }

    let elapsed = started.elapsed();
    if elapsed > period {
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "window flush overran the period, skipping missed ticks"
        );
    }
}

/// Delivers batches in order until the aggregator hangs up.
fn run_delivery(stage: DeliveryStage, batches: Receiver<Batch>) {
    for batch in batches.iter() {
        match stage.deliver(&batch) {
            Ok(ack) => {
                info!(
                    window = %ack.window,
                    devices = ack.devices,
                    remote_path = %ack.remote_path,
                    "batch delivered"
                );
                // The store is reachable again, catch up on anything retained
                if stage.has_pending() {
                    if let Err(e) = stage.retry_pending() {
                        warn!(error = %e, "could not list retained checkpoints");
                    }
                }
            }
            Err(e) if e.is_recoverable() => error!(
                window = %e.window(),
                devices = e.devices(),
                error = %e,
                "delivery failed, checkpoint retained"
            ),
            Err(e) => error!(
                window = %e.window(),
                devices = e.devices(),
                error = %e,
                "window lost"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::RawSighting;
    use crate::stats::create_shared_stats;

    fn sighting(device_id: &str, rssi: i32) -> Sighting {
        Sighting {
            device_id: device_id.to_string(),
            display_name: "Unknown".to_string(),
            signal_strength: rssi,
            observed_at: Utc::now(),
            distance: 1.0,
        }
    }

    #[test]
    fn test_close_window_hands_off_batch() {
        let (queue_tx, queue_rx) = sighting_queue();
        let (batch_tx, batch_rx) = unbounded();
        let stats = create_shared_stats();
        let mut aggregator = Aggregator::new(DistanceModel::default());

        for rssi in [-55, -60, -65] {
            queue_tx.enqueue(sighting("AA:BB:CC:DD:EE:FF", rssi));
        }
        close_window(&mut aggregator, &queue_rx, &batch_tx, &stats, Duration::from_secs(1));

        let batch = batch_rx.try_recv().unwrap();
        assert_eq!(batch.device_count(), 1);
        assert!((batch.summaries[0].mean_signal_strength - -60.0).abs() < 1e-9);

        // Nothing new: no batch, counted as empty
        close_window(&mut aggregator, &queue_rx, &batch_tx, &stats, Duration::from_secs(1));
        assert!(batch_rx.try_recv().is_err());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.windows_flushed, 1);
        assert_eq!(snapshot.empty_windows, 1);
    }

    #[test]
    fn test_window_isolation() {
        let (queue_tx, queue_rx) = sighting_queue();
        let (batch_tx, batch_rx) = unbounded();
        let stats = create_shared_stats();
        let mut aggregator = Aggregator::new(DistanceModel::default());

        queue_tx.enqueue(sighting("first", -50));
        close_window(&mut aggregator, &queue_rx, &batch_tx, &stats, Duration::from_secs(1));
        queue_tx.enqueue(sighting("second", -50));
        close_window(&mut aggregator, &queue_rx, &batch_tx, &stats, Duration::from_secs(1));

        let first = batch_rx.try_recv().unwrap();
        let second = batch_rx.try_recv().unwrap();
        assert_eq!(first.summaries.len(), 1);
        assert_eq!(first.summaries[0].device_id, "first");
        assert_eq!(second.summaries[0].device_id, "second");
        assert!(first.label < second.label);
    }

    #[test]
    fn test_wind_down_keeps_every_accepted_sighting() {
        let config = PipelineConfig {
            period: Duration::from_secs(60),
            ..PipelineConfig::default()
        };

        for _ in 0..10 {
            let (events_tx, events_rx) = unbounded();
            for i in 0..20_000 {
                events_tx
                    .send(ScanEvent::Advertisement(RawSighting::new(
                        format!("device-{i}"),
                        None,
                        -60,
                    )))
                    .unwrap();
            }
            let (batch_tx, batch_rx) = unbounded();
            let (exit_tx, _exit_rx) = unbounded();
            let stats = create_shared_stats();

            let intake = spawn_intake(events_rx, &config, &stats, batch_tx, &exit_tx).unwrap();
            thread::sleep(Duration::from_millis(2));
            intake.wind_down().unwrap();

            // One sighting per device, so summaries count sightings
            let summarized: usize = batch_rx.try_iter().map(|b| b.device_count()).sum();
            assert_eq!(summarized as u64, stats.snapshot().sightings_received);
            drop(events_tx);
        }
    }

    #[test]
    fn test_feed_stops_on_shutdown() {
        let (_events_tx, events_rx) = unbounded::<ScanEvent>();
        let (queue_tx, _queue_rx) = sighting_queue();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let stats = create_shared_stats();

        let handle = thread::spawn(move || {
            run_scan_feed(events_rx, queue_tx, DistanceModel::default(), shutdown_rx, stats)
        });
        drop(shutdown_tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_feed_counts_faults_and_sightings() {
        let (events_tx, events_rx) = unbounded();
        let (queue_tx, queue_rx) = sighting_queue();
        let (_shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let stats = create_shared_stats();

        events_tx
            .send(ScanEvent::Advertisement(RawSighting::new(
                "AA:BB:CC:DD:EE:FF",
                None,
                -60,
            )))
            .unwrap();
        events_tx.send(ScanEvent::Fault("adapter reset".to_string())).unwrap();
        drop(events_tx);

        run_scan_feed(events_rx, queue_tx, DistanceModel::default(), shutdown_rx, stats.clone());

        let queued = queue_rx.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].display_name, "Unknown");
        assert_eq!(stats.snapshot().sightings_received, 1);
        assert_eq!(stats.snapshot().sensor_faults, 1);
    }
}
