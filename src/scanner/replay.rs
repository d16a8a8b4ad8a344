//! JSON-lines scanner.
//!
//! Reads one advertisement per line from a file or stdin, e.g. the output of
//! a small bridge process sitting on the Bluetooth stack:
//!
//! ```text
//! {"address":"AA:BB:CC:DD:EE:FF","name":"Tag","rssi":-61,"timestamp":"2024-01-22T10:00:01Z"}
//! {"address":"11:22:33:44:55:66","name":null,"rssi":-78}
//! ```
//!
//! Lines that fail to parse are reported as [`ScanEvent::Fault`] and skipped.
//! The event channel disconnects once the input is exhausted.

use crate::scanner::types::{RawSighting, ScanEvent};
use crate::scanner::{Scanner, ScannerError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// Replays advertisements from a line-oriented reader.
pub struct ReplayScanner {
    source: Option<Box<dyn BufRead + Send>>,
    source_name: String,
    sender: Option<Sender<ScanEvent>>,
    receiver: Receiver<ScanEvent>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ReplayScanner {
    /// Replay from any buffered reader.
    pub fn from_reader<R>(reader: R, source_name: impl Into<String>) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        Self {
            source: Some(Box::new(reader)),
            source_name: source_name.into(),
            sender: Some(sender),
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Replay from a file.
    pub fn from_path(path: &Path) -> Result<Self, ScannerError> {
        let file = File::open(path)
            .map_err(|e| ScannerError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(Self::from_reader(
            BufReader::new(file),
            path.display().to_string(),
        ))
    }

    /// Replay from standard input.
    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(std::io::stdin()), "stdin")
    }
}

impl Scanner for ReplayScanner {
    fn start(&mut self) -> Result<(), ScannerError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ScannerError::AlreadyRunning);
        }
        let (source, sender) = match (self.source.take(), self.sender.take()) {
            (Some(source), Some(sender)) => (source, sender),
            _ => {
                return Err(ScannerError::Unavailable(format!(
                    "{} has already been replayed",
                    self.source_name
                )))
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let source_name = self.source_name.clone();

        let handle = thread::Builder::new()
            .name("replay-scanner".to_string())
            .spawn(move || {
                let emitted = run_replay(source, &sender, &running);
                info!(source = %source_name, emitted, "replay source finished");
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ScannerError::Unavailable(format!("failed to spawn replay thread: {e}"))
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            // A read blocked on stdin cannot be interrupted; leave that thread behind
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!(source = %self.source_name, "replay thread still blocked on input, detaching");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn receiver(&self) -> Receiver<ScanEvent> {
        self.receiver.clone()
    }
}

impl Drop for ReplayScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read lines until EOF, a read error, or stop. Returns the number of events sent.
fn run_replay(
    source: Box<dyn BufRead + Send>,
    sender: &Sender<ScanEvent>,
    running: &AtomicBool,
) -> u64 {
    let mut emitted = 0;

    for (index, line) in source.lines().enumerate() {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let (event, fatal) = match line {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawSighting>(line) {
                    Ok(raw) => (ScanEvent::Advertisement(raw), false),
                    Err(e) => (ScanEvent::Fault(format!("line {}: {e}", index + 1)), false),
                }
            }
            Err(e) => (ScanEvent::Fault(format!("read error: {e}")), true),
        };

        if sender.send(event).is_err() {
            break;
        }
        emitted += 1;

        if fatal {
            break;
        }
    }

    emitted
}
