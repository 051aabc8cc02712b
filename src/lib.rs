#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tripwire
//!
//! An adaptive circuit breaker and a retry orchestrator that protect calls to unreliable
//! dependencies: external APIs, databases, caches.
//!
//! ## Features
//!
//! - **Circuit breaker** with consecutive-failure and rolling error-percentage trips,
//!   half-open probing, operator overrides and optional adaptive thresholds
//! - **Admission control**: a non-blocking cap on concurrent calls per breaker
//! - **Timeouts** enforced per call (async and thread-based)
//! - **Fallback chain**: cache, named handlers, static response, payload renderer
//! - **Retry orchestrator** with exponential, linear, constant, Fibonacci and custom
//!   backoff plus proportional jitter, driven by breaker state
//! - **Health monitor**, **registry** and **factory** for running many breakers
//! - **Metrics** through a small sink trait; tracing, in-memory, `metrics` facade and
//!   Prometheus sinks
//! - **tower** layer
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tripwire::{
//!     CircuitBreaker, CircuitBreakerConfig, ResilienceError, RetryConfig, RetryOrchestrator,
//!     RetryStrategy,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let breaker = CircuitBreaker::new(
//!         "payments_api",
//!         CircuitBreakerConfig { failure_threshold: 3, ..Default::default() },
//!     )
//!     .unwrap();
//!     breaker.set_static_response("offline", "queued".to_string());
//!
//!     let retry = RetryOrchestrator::new(
//!         RetryConfig {
//!             max_attempts: 3,
//!             strategy: RetryStrategy::Exponential,
//!             base_delay: Duration::from_millis(10),
//!             ..Default::default()
//!         },
//!         breaker,
//!     )
//!     .unwrap();
//!
//!     let result: Result<String, ResilienceError<std::io::Error>> =
//!         retry.execute(|| async { Ok("charged".to_string()) }).await;
//!     assert_eq!(result.unwrap(), "charged");
//! }
//! ```

pub mod adaptive;
pub mod admission;
pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod error;
pub mod factory;
pub mod fallback;
pub mod health;
pub mod jitter;
pub mod metrics;
pub mod outcome;
pub mod registry;
pub mod retry;
pub mod service;
pub mod sleeper;
pub mod timeout;
pub mod window;

// Re-exports
pub use adaptive::{AdaptiveConfig, CategoryTuner, ThresholdTuner, TuningInput};
pub use admission::{AdmissionGate, AdmissionPermit, AdmissionRejected};
pub use backoff::{Backoff, RetryStrategy};
pub use circuit_breaker::{
    BreakerState, BreakerStats, CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig,
    HealthCheckReport,
};
pub use classifier::{classify_io_error, FailureClassifier};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ConfigError, ResilienceError};
pub use factory::{BreakerFactory, ResourceProfile};
pub use fallback::{
    FallbackCache, FallbackChain, FallbackContext, FallbackError, FallbackKey, FallbackPayload,
    FallbackReason, FallbackStep, FallbackStrategy, MemoryCache, Resolution,
};
pub use health::{HealthMonitor, HealthMonitorHandle, DEFAULT_HEALTH_INTERVAL};
pub use jitter::Jitter;
#[cfg(feature = "metrics")]
pub use metrics::FacadeMetrics;
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, TracingMetrics};
pub use outcome::{FailureCategory, Outcome};
pub use registry::{BreakerControl, BreakerRegistry, RegistryError};
pub use retry::{RetryConfig, RetryMetrics, RetryOrchestrator, RetryOrchestratorBuilder};
pub use service::{ResilienceLayer, ResilienceService};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimedOut, TimeoutPolicy};
pub use window::{FailureProfile, SlidingWindow};
