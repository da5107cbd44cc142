//! Metrics seam.
//!
//! Counters and timers per operation. Everything that records metrics goes
//! through [`MetricsRecorder`], so an uninstalled recorder is just
//! [`NoopMetrics`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Counter and timer sink.
pub trait MetricsRecorder: Send + Sync {
    /// Adds `value` to the counter `name`.
    fn increment(&self, name: &str, value: u64);

    /// Records one timing sample for `name`.
    fn record_duration(&self, name: &str, duration: Duration);
}

/// Recorder that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn increment(&self, _name: &str, _value: u64) {}

    fn record_duration(&self, _name: &str, _duration: Duration) {}
}

/// Aggregated timing samples for one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingSummary {
    /// Number of samples.
    pub count: u64,
    /// Sum of all samples.
    pub total: Duration,
    /// Largest sample.
    pub max: Duration,
}

#[derive(Default)]
struct MetricsState {
    counters: HashMap<String, u64>,
    timings: HashMap<String, TimingSummary>,
}

/// Recorder that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryMetrics {
    state: Mutex<MetricsState>,
}

impl fmt::Debug for InMemoryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMetrics")
            .field("counters", &self.state.try_lock().map(|s| s.counters.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl InMemoryMetrics {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of counter `name`, zero if never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.state.lock().map(|s| s.counters.get(name).copied().unwrap_or(0)).unwrap_or(0)
    }

    /// Timing summary for `name`, if any sample was recorded.
    pub fn timing(&self, name: &str) -> Option<TimingSummary> {
        self.state.lock().ok().and_then(|s| s.timings.get(name).copied())
    }

    /// Copy of all counters.
    pub fn counters(&self) -> HashMap<String, u64> {
        self.state.lock().map(|s| s.counters.clone()).unwrap_or_default()
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn increment(&self, name: &str, value: u64) {
        if let Ok(mut state) = self.state.lock() {
            *state.counters.entry(name.to_string()).or_insert(0) += value;
        }
    }

    fn record_duration(&self, name: &str, duration: Duration) {
        if let Ok(mut state) = self.state.lock() {
            let summary = state.timings.entry(name.to_string()).or_default();
            summary.count += 1;
            summary.total += duration;
            summary.max = summary.max.max(duration);
        }
    }
}
