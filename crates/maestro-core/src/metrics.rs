//! Switchable metrics recorder.

use maestro_agents::MetricsRecorder;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Forwards to an inner recorder while enabled and drops samples otherwise.
///
/// Clones share the switch, so `configure` can turn metrics off for every
/// component at once.
#[derive(Clone)]
pub struct MetricsGate {
    inner: Arc<dyn MetricsRecorder>,
    enabled: Arc<AtomicBool>,
}

impl fmt::Debug for MetricsGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsGate").field("enabled", &self.is_enabled()).finish_non_exhaustive()
    }
}

impl MetricsGate {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn MetricsRecorder>, enabled: bool) -> Self {
        Self { inner, enabled: Arc::new(AtomicBool::new(enabled)) }
    }

    /// Turns recording on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether samples are forwarded.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl MetricsRecorder for MetricsGate {
    fn increment(&self, name: &str, value: u64) {
        if self.is_enabled() {
            self.inner.increment(name, value);
        }
    }

    fn record_duration(&self, name: &str, duration: Duration) {
        if self.is_enabled() {
            self.inner.record_duration(name, duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_agents::InMemoryMetrics;

    #[test]
    fn test_gate_drops_samples_when_disabled() {
        let inner = Arc::new(InMemoryMetrics::new());
        let gate = MetricsGate::new(inner.clone(), true);
        let shared = gate.clone();

        gate.increment("workflows.started", 1);
        shared.set_enabled(false);
        gate.increment("workflows.started", 1);
        gate.record_duration("workflow.duration", Duration::from_millis(5));

        assert_eq!(inner.counter("workflows.started"), 1);
        assert!(inner.timing("workflow.duration").is_none());
        assert!(!gate.is_enabled());
    }
}
