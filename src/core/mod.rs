//! Core functionality for the BLE Sensor Agent.
//!
//! This module contains:
//! - The RSSI to distance model
//! - The sighting queue between scan feed and aggregator
//! - Window aggregation into per-device summaries

pub mod distance;
pub mod queue;
pub mod types;
pub mod windowing;

// Re-export commonly used types
pub use distance::DistanceModel;
pub use queue::{sighting_queue, SightingReceiver, SightingSender};
pub use types::{Batch, DeviceSummary, Sighting};
pub use windowing::Aggregator;
