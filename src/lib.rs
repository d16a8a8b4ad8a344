//! BLE Sensor Agent - beacon proximity sensor with durable remote delivery.
//!
//! Turns a stream of BLE advertisement sightings into fixed-period
//! per-device summaries (mean RSSI, estimated distance) and ships each
//! window to a remote store.
//!
//! # Delivery Guarantees
//!
//! - **Checkpoint first**: every window is written locally before any upload
//! - **Removed on confirmation**: a checkpoint only goes once the store has it
//! - **Idempotent retries**: re-uploading a window overwrites the same remote file
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         BLE Sensor Agent                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌───────────┐   ┌────────────┐   ┌───────────┐  │
//! │  │  Scanner  │──▶│ Sighting  │──▶│ Aggregator │──▶│ Delivery  │  │
//! │  │ (events)  │   │   Queue   │   │ (period)   │   │  stage    │  │
//! │  └───────────┘   └───────────┘   └────────────┘   └───────────┘  │
//! │                                                      │     │     │
//! │                                                      ▼     ▼     │
//! │                                             ┌──────────┐ ┌─────┐ │
//! │                                             │Checkpoint│ │Store│ │
//! │                                             └──────────┘ └─────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ble_sensor_agent::{create_shared_stats, Config, PipelineSupervisor, ReplayScanner};
//!
//! let mut config = Config::default();
//! config.remote_endpoint = Some("file:///srv/ble".to_string());
//!
//! let scanner = ReplayScanner::from_path("sightings.jsonl".as_ref()).expect("open replay");
//! let supervisor = PipelineSupervisor::from_config(&config, scanner, create_shared_stats())
//!     .expect("build pipeline");
//!
//! let (_stop_tx, stop_rx) = crossbeam_channel::bounded(1);
//! let report = supervisor.run(stop_rx).expect("pipeline failed");
//! println!("{}", report.stats);
//! ```

pub mod config;
pub mod core;
pub mod delivery;
pub mod pipeline;
pub mod scanner;
pub mod stats;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use core::{Aggregator, Batch, DeviceSummary, DistanceModel, Sighting};
pub use delivery::{
    CheckpointStore, DeliveryError, DeliveryStage, DirectoryTransport, HttpTransport, Transport,
    TransportError, UploadOutcome,
};
pub use pipeline::{PipelineConfig, PipelineError, PipelineReport, PipelineSupervisor};
pub use scanner::{NoopScanner, RawSighting, ReplayScanner, ScanEvent, Scanner, ScannerError};
pub use stats::{create_shared_stats, PipelineStats, SharedStats, StatsSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
