//! Metrics emission
//!
//! Breakers, fallback chains and orchestrators report through a [`MetricsSink`]. The sink
//! owns storage and export; this crate only names the series and supplies labels.
//!
//! | Series | Kind | Labels |
//! |---|---|---|
//! | `circuit_breaker_calls_total` | counter | `breaker`, `result` |
//! | `circuit_breaker_call_duration_ms` | histogram | `breaker` |
//! | `circuit_breaker_transitions_total` | counter | `breaker`, `from`, `to` |
//! | `circuit_breaker_state` | gauge (0 closed .. 4 forced_closed) | `breaker` |
//! | `circuit_breaker_rejected_total` | counter | `breaker`, `reason` |
//! | `circuit_breaker_failure_threshold` | gauge | `breaker` |
//! | `fallback_used_total` | counter | `breaker`, `step` |
//! | `fallback_failures_total` | counter | `breaker`, `step` |
//! | `retry_attempts_total` | counter | `breaker` |
//! | `retry_delay_ms` | histogram | `breaker` |
//! | `retry_outcomes_total` | counter | `breaker`, `result` |

use parking_lot::Mutex;
use std::collections::HashMap;

pub mod names {
    pub const CALLS_TOTAL: &str = "circuit_breaker_calls_total";
    pub const CALL_DURATION_MS: &str = "circuit_breaker_call_duration_ms";
    pub const TRANSITIONS_TOTAL: &str = "circuit_breaker_transitions_total";
    pub const STATE: &str = "circuit_breaker_state";
    pub const REJECTED_TOTAL: &str = "circuit_breaker_rejected_total";
    pub const FAILURE_THRESHOLD: &str = "circuit_breaker_failure_threshold";
    pub const FALLBACK_USED_TOTAL: &str = "fallback_used_total";
    pub const FALLBACK_FAILURES_TOTAL: &str = "fallback_failures_total";
    pub const RETRY_ATTEMPTS_TOTAL: &str = "retry_attempts_total";
    pub const RETRY_DELAY_MS: &str = "retry_delay_ms";
    pub const RETRY_OUTCOMES_TOTAL: &str = "retry_outcomes_total";
}

/// Label pairs attached to one observation.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Destination for counters, histograms and gauges.
///
/// Implementations must be cheap and must not block: breakers call them on the hot path,
/// though never while holding their state lock.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn increment_counter(&self, name: &str, labels: Labels<'_>);
    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>);
    fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: Labels<'_>) {}
    fn record_histogram(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
}

/// Writes each observation as a `tracing` event at TRACE level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        tracing::trace!(metric = name, kind = "counter", labels = ?labels);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        tracing::trace!(metric = name, kind = "histogram", value, labels = ?labels);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        tracing::trace!(metric = name, kind = "gauge", value, labels = ?labels);
    }
}

type SeriesKey = (String, Vec<(String, String)>);

fn series_key(name: &str, labels: Labels<'_>) -> SeriesKey {
    let mut pairs: Vec<(String, String)> =
        labels.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
    pairs.sort();
    (name.to_owned(), pairs)
}

fn matches(key: &SeriesKey, name: &str, filter: Labels<'_>) -> bool {
    key.0 == name
        && filter.iter().all(|(k, v)| key.1.iter().any(|(kk, vv)| kk == k && vv == v))
}

/// Keeps every series in memory. Intended for tests and debugging.
///
/// Lookups take a label *filter*: a series matches when it carries every given pair, so
/// `counter(name, &[])` sums across all label sets.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<SeriesKey, u64>>,
    histograms: Mutex<HashMap<SeriesKey, Vec<f64>>>,
    gauges: Mutex<HashMap<SeriesKey, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all counters named `name` whose labels include `filter`.
    pub fn counter(&self, name: &str, filter: Labels<'_>) -> u64 {
        self.counters.lock().iter().filter(|(k, _)| matches(k, name, filter)).map(|(_, v)| *v).sum()
    }

    /// Every value recorded into matching histograms, in no particular order across series.
    pub fn histogram(&self, name: &str, filter: Labels<'_>) -> Vec<f64> {
        self.histograms
            .lock()
            .iter()
            .filter(|(k, _)| matches(k, name, filter))
            .flat_map(|(_, v)| v.iter().copied())
            .collect()
    }

    /// Last value of the first matching gauge.
    pub fn gauge(&self, name: &str, filter: Labels<'_>) -> Option<f64> {
        self.gauges.lock().iter().find(|(k, _)| matches(k, name, filter)).map(|(_, v)| *v)
    }

    pub fn clear(&self) {
        self.counters.lock().clear();
        self.histograms.lock().clear();
        self.gauges.lock().clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        *self.counters.lock().entry(series_key(name, labels)).or_insert(0) += 1;
    }

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.histograms.lock().entry(series_key(name, labels)).or_default().push(value);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.gauges.lock().insert(series_key(name, labels), value);
    }
}

/// Forwards to whatever recorder is installed in the `metrics` facade.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetrics;

#[cfg(feature = "metrics")]
impl FacadeMetrics {
    fn labels(labels: Labels<'_>) -> Vec<metrics::Label> {
        labels.iter().map(|(k, v)| metrics::Label::new((*k).to_owned(), (*v).to_owned())).collect()
    }
}

#[cfg(feature = "metrics")]
impl MetricsSink for FacadeMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        metrics::counter!(name.to_owned(), Self::labels(labels)).increment(1);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        metrics::histogram!(name.to_owned(), Self::labels(labels)).record(value);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        metrics::gauge!(name.to_owned(), Self::labels(labels)).set(value);
    }
}
