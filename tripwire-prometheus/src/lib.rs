//! Prometheus metrics sink for `tripwire`.
//! Bring your own `prometheus::Registry`; metric families are registered on first use.

use parking_lot::Mutex;
use prometheus::{GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use tripwire::metrics::{names, Labels, MetricsSink};

/// Bucket bounds (milliseconds) for the duration and delay histograms.
pub const MILLIS_BUCKETS: &[f64] =
    &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0];

#[derive(Clone, Debug)]
enum Family {
    Counter(IntCounterVec),
    Histogram(HistogramVec),
    Gauge(GaugeVec),
}

impl Family {
    fn kind(&self) -> &'static str {
        match self {
            Family::Counter(_) => "counter",
            Family::Histogram(_) => "histogram",
            Family::Gauge(_) => "gauge",
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    family: Family,
    label_names: Vec<String>,
}

/// [`MetricsSink`] backed by a Prometheus registry.
///
/// A family's label names are fixed by the first observation of that name. Observations
/// whose label keys differ, or that reuse a name with another metric kind, are dropped
/// with a warning.
#[derive(Clone, Debug)]
pub struct PrometheusMetrics {
    registry: Arc<Registry>,
    families: Arc<Mutex<HashMap<String, Entry>>>,
}

impl PrometheusMetrics {
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Self {
        Self { registry: registry.into(), families: Arc::default() }
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn observe(&self, name: &str, kind: &'static str, labels: Labels<'_>, f: impl FnOnce(&Family, &[&str])) {
        let mut families = self.families.lock();
        let entry = match families.get(name) {
            Some(entry) => entry.clone(),
            None => match self.register(name, kind, labels) {
                Ok(entry) => {
                    families.insert(name.to_owned(), entry.clone());
                    entry
                }
                Err(err) => {
                    tracing::warn!(metric = name, error = %err, "failed to register metric family");
                    return;
                }
            },
        };
        drop(families);

        if entry.family.kind() != kind {
            tracing::warn!(metric = name, registered = entry.family.kind(), requested = kind, "metric kind mismatch");
            return;
        }
        let values: Option<Vec<&str>> = entry
            .label_names
            .iter()
            .map(|key| labels.iter().find(|(k, _)| *k == key.as_str()).map(|(_, v)| *v))
            .collect();
        match values {
            Some(values) if values.len() == labels.len() => f(&entry.family, &values),
            _ => tracing::warn!(metric = name, "label keys differ from the registered family"),
        }
    }

    fn register(&self, name: &str, kind: &'static str, labels: Labels<'_>) -> Result<Entry, prometheus::Error> {
        let label_names: Vec<String> = labels.iter().map(|(k, _)| (*k).to_owned()).collect();
        let keys: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let help = help(name);
        let family = match kind {
            "counter" => {
                let vec = IntCounterVec::new(Opts::new(name, help), &keys)?;
                self.registry.register(Box::new(vec.clone()))?;
                Family::Counter(vec)
            }
            "histogram" => {
                let opts = HistogramOpts::new(name, help).buckets(MILLIS_BUCKETS.to_vec());
                let vec = HistogramVec::new(opts, &keys)?;
                self.registry.register(Box::new(vec.clone()))?;
                Family::Histogram(vec)
            }
            _ => {
                let vec = GaugeVec::new(Opts::new(name, help), &keys)?;
                self.registry.register(Box::new(vec.clone()))?;
                Family::Gauge(vec)
            }
        };
        Ok(Entry { family, label_names })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        self.observe(name, "counter", labels, |family, values| {
            if let Family::Counter(vec) = family {
                if let Ok(counter) = vec.get_metric_with_label_values(values) {
                    counter.inc();
                }
            }
        });
    }

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.observe(name, "histogram", labels, |family, values| {
            if let Family::Histogram(vec) = family {
                if let Ok(histogram) = vec.get_metric_with_label_values(values) {
                    histogram.observe(value);
                }
            }
        });
    }

    fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.observe(name, "gauge", labels, |family, values| {
            if let Family::Gauge(vec) = family {
                if let Ok(gauge) = vec.get_metric_with_label_values(values) {
                    gauge.set(value);
                }
            }
        });
    }
}

fn help(name: &str) -> &'static str {
    match name {
        names::CALLS_TOTAL => "Calls that ran through a circuit breaker, by result",
        names::CALL_DURATION_MS => "Duration of calls that ran through a circuit breaker",
        names::TRANSITIONS_TOTAL => "Circuit breaker state transitions",
        names::STATE => "Circuit breaker state (0 closed, 1 open, 2 half_open, 3 forced_open, 4 forced_closed)",
        names::REJECTED_TOTAL => "Calls refused without running, by reason",
        names::FAILURE_THRESHOLD => "Effective consecutive-failure threshold",
        names::FALLBACK_USED_TOTAL => "Fallback values served, by step",
        names::FALLBACK_FAILURES_TOTAL => "Fallback steps that failed, by step",
        names::RETRY_ATTEMPTS_TOTAL => "Attempts made by retry orchestrators",
        names::RETRY_DELAY_MS => "Backoff delays scheduled between attempts",
        names::RETRY_OUTCOMES_TOTAL => "Retry loop outcomes",
        _ => "tripwire metric",
    }
}
