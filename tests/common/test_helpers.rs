use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tripwire::{
    CircuitBreaker, CircuitBreakerConfig, FailureCategory, InMemoryMetrics, ManualClock,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("connection reset")]
    Transient,
    #[error("upstream timed out")]
    Slow,
    #[error("request rejected: {0}")]
    Business(&'static str),
}

pub fn classify(err: &ServiceError) -> FailureCategory {
    match err {
        ServiceError::Transient => FailureCategory::Connection,
        ServiceError::Slow => FailureCategory::Timeout,
        ServiceError::Business(_) => FailureCategory::Business,
    }
}

/// Breaker wired to a manual clock and an in-memory sink.
pub struct Harness {
    pub breaker: CircuitBreaker<String, ServiceError>,
    pub clock: ManualClock,
    pub metrics: Arc<InMemoryMetrics>,
}

pub fn harness(name: &str, config: CircuitBreakerConfig) -> Harness {
    let clock = ManualClock::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let breaker = CircuitBreaker::builder(name, config)
        .clock(clock.clone())
        .metrics(metrics.clone())
        .classify(classify)
        .build()
        .expect("valid breaker config");
    Harness { breaker, clock, metrics }
}

/// Counts invocations of an operation.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one invocation and return its zero-based index.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
