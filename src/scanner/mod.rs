//! Beacon scanners feeding the pipeline.
//!
//! The radio itself lives outside this crate. A scanner only has to deliver
//! [`ScanEvent`]s on a channel and honour start/stop.

pub mod noop;
pub mod replay;
pub mod types;

// Re-export commonly used types
pub use noop::NoopScanner;
pub use replay::ReplayScanner;
pub use types::{RawSighting, ScanEvent};

use crossbeam_channel::Receiver;

/// Source of raw sightings.
pub trait Scanner: Send {
    /// Begin emitting events. Fails if the underlying source is unavailable.
    fn start(&mut self) -> Result<(), ScannerError>;

    /// Stop emitting events.
    fn stop(&mut self);

    /// Check if the scanner is currently running.
    fn is_running(&self) -> bool;

    /// Channel the events arrive on. Disconnects when the source is exhausted.
    fn receiver(&self) -> Receiver<ScanEvent>;
}

/// Errors that can occur when starting a scanner.
#[derive(Debug)]
pub enum ScannerError {
    AlreadyRunning,
    Unavailable(String),
}

impl std::fmt::Display for ScannerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScannerError::AlreadyRunning => write!(f, "Scanner is already running"),
            ScannerError::Unavailable(e) => write!(f, "Scanner unavailable: {e}"),
        }
    }
}

impl std::error::Error for ScannerError {}
