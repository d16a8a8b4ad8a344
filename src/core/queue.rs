//! Unbounded hand-off between the scan feed and the aggregator.
//!
//! Enqueue never blocks: stalling the radio side is worse than holding a few
//! more sightings in memory. The consumer side only offers a snapshot drain,
//! so there is no check-then-take race.

use crate::core::types::Sighting;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

/// Create a connected sender/receiver pair.
pub fn sighting_queue() -> (SightingSender, SightingReceiver) {
    let (sender, receiver) = unbounded();
    (
        SightingSender { inner: sender },
        SightingReceiver { inner: receiver },
    )
}

/// Producer half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SightingSender {
    inner: Sender<Sighting>,
}

impl SightingSender {
    /// Enqueue without blocking.
    ///
    /// Returns `false` if the consumer has gone away; the sighting is dropped.
    pub fn enqueue(&self, sighting: Sighting) -> bool {
        match self.inner.send(sighting) {
            Ok(()) => true,
            Err(e) => {
                debug!(device_id = %e.0.device_id, "sighting dropped, queue closed");
                false
            }
        }
    }
}

/// Consumer half. Owned by the aggregation loop only.
#[derive(Debug)]
pub struct SightingReceiver {
    inner: Receiver<Sighting>,
}

impl SightingReceiver {
    /// Take everything buffered at the moment of the call.
    ///
    /// The length is read once up front; sightings enqueued while the drain
    /// runs are left for the next call.
    pub fn drain(&self) -> Vec<Sighting> {
        let available = self.inner.len();
        self.inner.try_iter().take(available).collect()
    }

    /// Number of sightings currently buffered.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
