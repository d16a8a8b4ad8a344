//! Window aggregation of sightings into per-device summaries.
//!
//! Sightings are merged by device ID until the window is flushed. Each flush
//! yields at most one [`Batch`] and resets all per-device state.

use crate::core::distance::DistanceModel;
use crate::core::types::{Batch, DeviceSummary, Sighting};
use chrono::{DateTime, Duration, DurationRound, Utc};
use statrs::statistics::Statistics;
use std::collections::HashMap;

/// Samples collected for one device during the current window.
#[derive(Debug, Clone)]
struct WindowAccumulator {
    /// Name from the first sighting of the window
    display_name: String,
    /// Raw RSSI samples in arrival order
    signal_strength_samples: Vec<f64>,
    /// Observation times in arrival order
    observed_at_samples: Vec<DateTime<Utc>>,
}

impl WindowAccumulator {
    fn new(sighting: &Sighting) -> Self {
        Self {
            display_name: sighting.display_name.clone(),
            signal_strength_samples: vec![sighting.signal_strength as f64],
            observed_at_samples: vec![sighting.observed_at],
        }
    }

    fn add(&mut self, sighting: &Sighting) {
        self.signal_strength_samples
            .push(sighting.signal_strength as f64);
        self.observed_at_samples.push(sighting.observed_at);
    }

    /// Number of sightings merged so far.
    fn sample_count(&self) -> usize {
        self.signal_strength_samples.len()
    }

    /// Arithmetic mean of the raw dBm samples.
    fn mean_signal_strength(&self) -> f64 {
        self.signal_strength_samples.iter().mean()
    }

    /// Mean of the observation times (microsecond precision).
    fn mean_observed_at(&self) -> DateTime<Utc> {
        let mean_micros = self
            .observed_at_samples
            .iter()
            .map(|t| t.timestamp_micros() as f64)
            .mean();

        DateTime::from_timestamp_micros(mean_micros.round() as i64)
            .unwrap_or(self.observed_at_samples[0])
    }

    /// Collapse into a summary. Distance comes from the mean RSSI, not from
    /// averaging per-sample distances.
    fn summarize(self, device_id: String, model: &DistanceModel) -> DeviceSummary {
        let mean_signal_strength = self.mean_signal_strength();
        DeviceSummary {
            window_timestamp: self.mean_observed_at(),
            device_id,
            derived_distance: model.distance(mean_signal_strength),
            display_name: self.display_name,
            mean_signal_strength,
        }
    }
}

/// Merges sightings by device until the window is flushed.
pub struct Aggregator {
    /// Model applied to each window's mean RSSI
    model: DistanceModel,
    /// Device IDs in first-seen order
    order: Vec<String>,
    /// Per-device state for the open window
    accumulators: HashMap<String, WindowAccumulator>,
    /// Close time of the previous batch, used to keep labels unique
    last_closed_at: Option<DateTime<Utc>>,
}

impl Aggregator {
    pub fn new(model: DistanceModel) -> Self {
        Self {
            model,
            order: Vec::new(),
            accumulators: HashMap::new(),
            last_closed_at: None,
        }
    }

    /// Merge one sighting into the open window.
    pub fn ingest(&mut self, sighting: Sighting) {
        match self.accumulators.get_mut(&sighting.device_id) {
            Some(acc) => acc.add(&sighting),
            None => {
                self.accumulators
                    .insert(sighting.device_id.clone(), WindowAccumulator::new(&sighting));
                self.order.push(sighting.device_id);
            }
        }
    }

    /// Merge a drained set of sightings.
    pub fn ingest_all<I>(&mut self, sightings: I)
    where
        I: IntoIterator<Item = Sighting>,
    {
        for sighting in sightings {
            self.ingest(sighting);
        }
    }

    /// Number of distinct devices in the open window.
    pub fn device_count(&self) -> usize {
        self.order.len()
    }

    /// Number of sightings in the open window.
    pub fn sample_count(&self) -> usize {
        self.accumulators
            .values()
            .map(WindowAccumulator::sample_count)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Close the open window.
    ///
    /// Returns `None` when nothing was observed. The batch label is derived
    /// from `closed_at`, bumped forward by a millisecond when it would not be
    /// strictly later than the previous batch, so labels never repeat.
    pub fn flush(&mut self, closed_at: DateTime<Utc>) -> Option<Batch> {
        if self.is_empty() {
            return None;
        }

        let closed_at = self.next_close_time(closed_at);
        let mut accumulators = std::mem::take(&mut self.accumulators);
        let summaries = std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|device_id| {
                accumulators
                    .remove(&device_id)
                    .map(|acc| acc.summarize(device_id, &self.model))
            })
            .collect();

        self.last_closed_at = Some(closed_at);
        Some(Batch::new(closed_at, summaries))
    }

    fn next_close_time(&self, requested: DateTime<Utc>) -> DateTime<Utc> {
        let tick = Duration::milliseconds(1);
        let requested = requested.duration_trunc(tick).unwrap_or(requested);
        match self.last_closed_at {
            Some(last) if requested <= last => last + tick,
            _ => requested,
        }
    }
}
