//! Idle scanner that never emits events.
//!
//! Lets the agent run its delivery side (retry, health check, shutdown)
//! without any radio source attached.

use crate::scanner::types::ScanEvent;
use crate::scanner::{Scanner, ScannerError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A noop scanner that never emits events.
pub struct NoopScanner {
    // Held so the channel stays connected while idle
    _sender: Sender<ScanEvent>,
    receiver: Receiver<ScanEvent>,
    running: Arc<AtomicBool>,
}

impl NoopScanner {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            _sender: sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for NoopScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner for NoopScanner {
    fn start(&mut self) -> Result<(), ScannerError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ScannerError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn receiver(&self) -> Receiver<ScanEvent> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop() {
        let mut scanner = NoopScanner::new();
        scanner.start().unwrap();
        assert!(scanner.is_running());
        assert!(matches!(scanner.start(), Err(ScannerError::AlreadyRunning)));

        scanner.stop();
        assert!(!scanner.is_running());
        assert!(scanner.receiver().try_recv().is_err());
    }
}
