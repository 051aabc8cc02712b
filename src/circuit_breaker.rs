//! Circuit breaker state machine
//!
//! ```text
//!            failures >= threshold
//!            or error% >= threshold
//!   CLOSED ──────────────────────────▶ OPEN
//!     ▲                                 │ recovery_timeout elapsed
//!     │ success_threshold probe         │ (next call or health tick)
//!     │ successes                       ▼
//!     └──────────────────────────── HALF_OPEN ──▶ OPEN on any failure
//!
//!   FORCED_OPEN / FORCED_CLOSED: operator overrides, left only through reset()
//! ```
//!
//! All bookkeeping (state, counters, sliding window) sits behind one `parking_lot::Mutex`
//! that is held for O(1) work only: never across the wrapped call, a timeout wait, or a
//! fallback handler. Recording an outcome and evaluating the transition it causes happen
//! in the same critical section, so no caller observes a half-evaluated state. Logs and
//! metrics for a transition are emitted after the lock is released.
//!
//! Admission is checked in two steps: the state machine first (fast-fail while open,
//! reserve a probe slot while half-open), then the concurrency gate. Both reservations are
//! RAII guards, so a panicking or cancelled call gives its slot back.

use crate::adaptive::{next_threshold, AdaptiveConfig, CategoryTuner, ThresholdTuner, TuningInput};
use crate::admission::{AdmissionGate, AdmissionPermit};
use crate::classifier::FailureClassifier;
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use crate::fallback::{
    FallbackCache, FallbackChain, FallbackContext, FallbackError, FallbackKey, FallbackPayload,
    FallbackReason, FallbackStrategy, Resolution,
};
use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::outcome::{FailureCategory, Outcome};
use crate::timeout::TimeoutPolicy;
use crate::window::SlidingWindow;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Current state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BreakerState {
    /// Calls flow; failures are counted.
    Closed,
    /// Calls are short-circuited until the recovery timeout elapses.
    Open,
    /// A limited number of probe calls test whether the dependency recovered.
    HalfOpen,
    /// Operator override: every call is short-circuited.
    ForcedOpen,
    /// Operator override: calls flow and are recorded, but the breaker never trips.
    ForcedClosed,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
            BreakerState::ForcedOpen => "forced_open",
            BreakerState::ForcedClosed => "forced_closed",
        }
    }

    /// Value reported on the `circuit_breaker_state` gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
            BreakerState::ForcedOpen => 3.0,
            BreakerState::ForcedClosed => 4.0,
        }
    }

    pub fn is_forced(self) -> bool {
        matches!(self, BreakerState::ForcedOpen | BreakerState::ForcedClosed)
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker configuration. Immutable once the breaker is built.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: usize,
    /// Rolling error percentage (0, 100] that trips a closed breaker.
    pub error_percentage_threshold: f64,
    /// Outcomes kept in the sliding window.
    pub window_size: usize,
    /// Outcomes the window must hold before the error-percentage rule applies.
    pub minimum_calls: usize,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
    /// Consecutive probe successes that close a half-open breaker.
    pub success_threshold: usize,
    /// Probe calls allowed in flight while half-open.
    pub half_open_max_calls: usize,
    /// Concurrent calls admitted in any state.
    pub max_concurrent_calls: usize,
    /// Deadline for a single call.
    pub timeout: Duration,
    pub fallback_strategy: FallbackStrategy,
    /// Enables threshold tuning on health-check ticks.
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_percentage_threshold: 50.0,
            window_size: 100,
            minimum_calls: 10,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            half_open_max_calls: 1,
            max_concurrent_calls: 100,
            timeout: Duration::from_secs(30),
            fallback_strategy: FallbackStrategy::default(),
            adaptive: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(self.failure_threshold));
        }
        let pct = self.error_percentage_threshold;
        if !(pct > 0.0 && pct <= 100.0) {
            return Err(ConfigError::InvalidErrorPercentage(pct));
        }
        if self.window_size == 0 {
            return Err(ConfigError::InvalidWindowSize(self.window_size));
        }
        if self.minimum_calls == 0 || self.minimum_calls > self.window_size {
            return Err(ConfigError::InvalidMinimumCalls {
                provided: self.minimum_calls,
                window_size: self.window_size,
            });
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::InvalidRecoveryTimeout(self.recovery_timeout));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::InvalidSuccessThreshold(self.success_threshold));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::InvalidHalfOpenLimit(self.half_open_max_calls));
        }
        if self.max_concurrent_calls == 0 || self.max_concurrent_calls > Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidMaxConcurrentCalls {
                provided: self.max_concurrent_calls,
                max: Semaphore::MAX_PERMITS,
            });
        }
        TimeoutPolicy::new(self.timeout)?;
        if let Some(adaptive) = &self.adaptive {
            adaptive.validate(self.failure_threshold)?;
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    /// Consecutive failures since the last success.
    pub failure_count: usize,
    /// Consecutive successes since the last failure.
    pub success_count: usize,
    pub error_percentage: f64,
    /// Outcomes currently held in the window.
    pub window_size: usize,
    pub window_capacity: usize,
    /// Effective consecutive-failure threshold (differs from config once tuned).
    pub failure_threshold: usize,
    pub total_calls: u64,
    /// Calls refused by the concurrency gate.
    pub rejected_calls: u64,
    /// Calls refused because the breaker was open.
    pub short_circuited_calls: u64,
    pub in_flight: usize,
    pub last_state_change_millis: u64,
}

/// Result of one health-check pass over a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckReport {
    pub name: String,
    pub state: BreakerState,
    /// An open breaker was moved to half-open by this check.
    pub promoted: bool,
    pub threshold_before: usize,
    pub threshold_after: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cause {
    ConsecutiveFailures { failures: usize, threshold: usize },
    ErrorPercentage { percentage: f64, threshold: f64 },
    RecoveryElapsed,
    ProbeFailed,
    ProbesSucceeded { successes: usize },
    Forced,
    Reset,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: BreakerState,
    to: BreakerState,
    cause: Cause,
}

#[derive(Debug)]
struct Core {
    state: BreakerState,
    changed_at: u64,
    /// Bumped on every transition; probe slots from older epochs are ignored.
    epoch: u64,
    consecutive_failures: usize,
    consecutive_successes: usize,
    half_open_successes: usize,
    half_open_in_flight: usize,
    failure_threshold: usize,
    window: SlidingWindow,
}

impl Core {
    fn transition(&mut self, to: BreakerState, cause: Cause, now: u64) -> Transition {
        let from = self.state;
        self.state = to;
        self.changed_at = now;
        self.epoch = self.epoch.wrapping_add(1);
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
        Transition { from, to, cause }
    }
}

/// A reserved half-open probe slot. Released on drop unless the outcome was recorded.
struct ProbeSlot<'a> {
    core: &'a Mutex<Core>,
    epoch: u64,
    armed: bool,
}

impl ProbeSlot<'_> {
    /// Give the slot back; true when it still belonged to the current half-open period.
    fn release(&mut self, core: &mut Core) -> bool {
        if !self.armed {
            return false;
        }
        self.armed = false;
        if core.epoch == self.epoch && core.state == BreakerState::HalfOpen {
            core.half_open_in_flight = core.half_open_in_flight.saturating_sub(1);
            true
        } else {
            false
        }
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let lock = self.core;
            let mut core = lock.lock();
            self.release(&mut core);
        }
    }
}

struct Ticket<'a> {
    probe: Option<ProbeSlot<'a>>,
    /// Taken by blocking calls so an abandoned worker keeps its slot until it returns.
    permit: Option<AdmissionPermit>,
}

struct Shared<T, E> {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<Core>,
    gate: AdmissionGate,
    timeout: TimeoutPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    classifier: FailureClassifier<E>,
    fallback: FallbackChain<T, E>,
    tuner: Arc<dyn ThresholdTuner>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
    short_circuited_calls: AtomicU64,
}

/// Circuit breaker guarding calls to one resource.
///
/// `T` is the protected call's success type and `E` its error type. Clones share state, so
/// every handle observes and drives the same state machine.
///
/// ```
/// use tripwire::{CircuitBreaker, CircuitBreakerConfig};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = CircuitBreakerConfig { failure_threshold: 3, ..Default::default() };
/// let breaker: CircuitBreaker<String, std::io::Error> =
///     CircuitBreaker::new("users_api", config).unwrap();
/// breaker.set_static_response("cached_user", "guest".to_string());
///
/// let user = breaker.call(|| async { Ok("alice".to_string()) }).await.unwrap();
/// assert_eq!(user, "alice");
/// # }
/// ```
pub struct CircuitBreaker<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for CircuitBreaker<T, E> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T, E> fmt::Debug for CircuitBreaker<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("state", &core.state)
            .field("consecutive_failures", &core.consecutive_failures)
            .field("window", &core.window.len())
            .finish()
    }
}

/// Builder for [`CircuitBreaker`] collaborators beyond the config.
pub struct CircuitBreakerBuilder<T, E> {
    name: String,
    config: CircuitBreakerConfig,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    classifier: FailureClassifier<E>,
    cache: Option<Arc<dyn FallbackCache<T>>>,
    tuner: Option<Arc<dyn ThresholdTuner>>,
}

impl<T, E> fmt::Debug for CircuitBreakerBuilder<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T, E> CircuitBreakerBuilder<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn classifier(mut self, classifier: FailureClassifier<E>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Shorthand for `classifier(FailureClassifier::new(f))`.
    pub fn classify<F>(self, f: F) -> Self
    where
        F: Fn(&E) -> FailureCategory + Send + Sync + 'static,
    {
        self.classifier(FailureClassifier::new(f))
    }

    /// Cache read by the cache-first fallback step and written on keyed successes.
    pub fn cache(mut self, cache: Arc<dyn FallbackCache<T>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the default [`CategoryTuner`]. Only used when `config.adaptive` is set.
    pub fn tuner<U: ThresholdTuner + 'static>(mut self, tuner: U) -> Self {
        self.tuner = Some(Arc::new(tuner));
        self
    }

    pub fn build(self) -> Result<CircuitBreaker<T, E>, ConfigError> {
        self.config.validate()?;
        if self.config.fallback_strategy == FallbackStrategy::CacheFirst && self.cache.is_none() {
            return Err(ConfigError::MissingCache);
        }
        let gate = AdmissionGate::new(self.config.max_concurrent_calls)?;
        let timeout = TimeoutPolicy::new(self.config.timeout)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let fallback = FallbackChain::new(
            self.name.clone(),
            self.config.fallback_strategy,
            self.cache,
            metrics.clone(),
        );
        let core = Core {
            state: BreakerState::Closed,
            changed_at: clock.now_millis(),
            epoch: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            failure_threshold: self.config.failure_threshold,
            window: SlidingWindow::new(self.config.window_size),
        };
        let breaker = CircuitBreaker {
            shared: Arc::new(Shared {
                name: self.name,
                core: Mutex::new(core),
                gate,
                timeout,
                clock,
                metrics,
                classifier: self.classifier,
                fallback,
                tuner: self.tuner.unwrap_or_else(|| Arc::new(CategoryTuner)),
                total_calls: AtomicU64::new(0),
                rejected_calls: AtomicU64::new(0),
                short_circuited_calls: AtomicU64::new(0),
                config: self.config,
            }),
        };
        breaker.publish_state(BreakerState::Closed);
        breaker.publish_threshold(breaker.shared.config.failure_threshold);
        Ok(breaker)
    }
}

impl<T, E> CircuitBreaker<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Validate `config` and build a breaker with default collaborators.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::builder(name, config).build()
    }

    pub fn builder(name: impl Into<String>, config: CircuitBreakerConfig) -> CircuitBreakerBuilder<T, E> {
        CircuitBreakerBuilder {
            name: name.into(),
            config,
            clock: None,
            metrics: None,
            classifier: FailureClassifier::default(),
            cache: None,
            tuner: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    pub fn classifier(&self) -> &FailureClassifier<E> {
        &self.shared.classifier
    }

    pub(crate) fn metrics_sink(&self) -> &Arc<dyn MetricsSink> {
        &self.shared.metrics
    }

    /// Current state. Does not advance OPEN to HALF_OPEN; that happens on the next call
    /// or health check.
    pub fn state(&self) -> BreakerState {
        self.shared.core.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let core = self.shared.core.lock();
        BreakerStats {
            name: self.shared.name.clone(),
            state: core.state,
            failure_count: core.consecutive_failures,
            success_count: core.consecutive_successes,
            error_percentage: core.window.error_percentage(),
            window_size: core.window.len(),
            window_capacity: core.window.capacity(),
            failure_threshold: core.failure_threshold,
            total_calls: self.shared.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.shared.rejected_calls.load(Ordering::Relaxed),
            short_circuited_calls: self.shared.short_circuited_calls.load(Ordering::Relaxed),
            in_flight: self.shared.gate.in_flight(),
            last_state_change_millis: core.changed_at,
        }
    }

    /// Run `operation` under the breaker; failures and fast-fails go through the fallback chain.
    pub async fn call<F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.guarded(None, None, operation).await {
            Ok(value) => Ok(value),
            Err(err) => self.resolve_fallback(None, err),
        }
    }

    /// Like [`call`](Self::call), but successes are cached under `key` and the cache-first
    /// fallback step can answer for it.
    pub async fn call_with_key<F, Fut>(
        &self,
        key: &FallbackKey,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.guarded(Some(key), None, operation).await {
            Ok(value) => Ok(value),
            Err(err) => self.resolve_fallback(Some(key), err),
        }
    }

    /// Run `operation` under the breaker without consulting the fallback chain.
    pub async fn try_call<F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guarded(None, None, operation).await
    }

    /// One attempt on behalf of a retry loop: optional tighter deadline, no fallback.
    pub(crate) async fn attempt<F, Fut>(
        &self,
        key: Option<&FallbackKey>,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guarded(key, timeout, operation).await
    }

    /// Blocking variant of [`call`](Self::call) for thread-based callers.
    ///
    /// The operation runs on a worker thread so the deadline can be enforced; an overrun
    /// operation is abandoned, not interrupted. Panics in `operation` propagate.
    pub fn call_blocking<F>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        match self.guarded_blocking(None, None, operation) {
            Ok(value) => Ok(value),
            Err(err) => self.resolve_fallback(None, err),
        }
    }

    pub fn call_blocking_with_key<F>(&self, key: &FallbackKey, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        match self.guarded_blocking(Some(key), None, operation) {
            Ok(value) => Ok(value),
            Err(err) => self.resolve_fallback(Some(key), err),
        }
    }

    pub(crate) fn attempt_blocking<F>(
        &self,
        key: Option<&FallbackKey>,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.guarded_blocking(key, timeout, operation)
    }

    async fn guarded<F, Fut>(
        &self,
        key: Option<&FallbackKey>,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ticket = self.admit()?;
        let started = Instant::now();
        let result = match self.shared.timeout.tightened(timeout).run(operation()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ResilienceError::Inner(err)),
            Err(t) => Err(ResilienceError::Timeout { elapsed: t.elapsed, timeout: t.timeout }),
        };
        self.finish(ticket, key, started.elapsed(), &result);
        result
    }

    fn guarded_blocking<F>(
        &self,
        key: Option<&FallbackKey>,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let mut ticket = self.admit()?;
        let permit = ticket.permit.take();
        let job = move || {
            let _permit = permit;
            operation()
        };
        let started = Instant::now();
        let result = match self.shared.timeout.tightened(timeout).run_blocking(job) {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(ResilienceError::Inner(err)),
            Ok(Err(t)) => Err(ResilienceError::Timeout { elapsed: t.elapsed, timeout: t.timeout }),
            Err(err) => return Err(self.worker_unavailable(err)),
        };
        self.finish(ticket, key, started.elapsed(), &result);
        result
    }

    /// No thread could be spawned for a blocking call. The operation never ran, so nothing
    /// enters the window; the call is refused like an admission rejection.
    fn worker_unavailable(&self, err: std::io::Error) -> ResilienceError<E> {
        self.shared.rejected_calls.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.increment_counter(
            names::REJECTED_TOTAL,
            &[("breaker", self.shared.name.as_str()), ("reason", "worker_unavailable")],
        );
        tracing::error!(breaker = %self.shared.name, error = %err, "could not spawn call worker thread");
        ResilienceError::Rejected {
            breaker: self.shared.name.clone(),
            in_flight: self.shared.gate.in_flight(),
            max: self.shared.gate.max_concurrent(),
        }
    }

    /// Walk the fallback chain for `error`.
    ///
    /// Returns the first fallback value, or the triggering error when nothing resolved. A
    /// short-circuited call (open breaker, full gate) whose fallback steps all failed
    /// surfaces as `FallbackExhausted`, since no operation error exists to report.
    pub fn resolve_fallback(
        &self,
        key: Option<&FallbackKey>,
        error: ResilienceError<E>,
    ) -> Result<T, ResilienceError<E>> {
        let ctx = FallbackContext {
            breaker: &self.shared.name,
            state: self.state(),
            reason: FallbackReason::of(&error),
            key,
            error: &error,
            timestamp_millis: self.shared.clock.now_millis(),
        };
        match self.shared.fallback.resolve(&ctx) {
            Resolution::Resolved { value, .. } => Ok(value),
            Resolution::Unresolved { attempted } => match error {
                ResilienceError::CircuitOpen { .. } | ResilienceError::Rejected { .. }
                    if attempted > 0 =>
                {
                    Err(ResilienceError::FallbackExhausted {
                        breaker: self.shared.name.clone(),
                        attempted,
                    })
                }
                other => Err(other),
            },
        }
    }

    /// Add a named fallback handler; handlers run in registration order.
    pub fn register_fallback<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&FallbackContext<'_, E>) -> Result<T, FallbackError> + Send + Sync + 'static,
    {
        self.shared.fallback.register_handler(name, handler);
    }

    pub fn set_static_response(&self, name: impl Into<String>, value: T) {
        self.shared.fallback.set_static_response(name, value);
    }

    /// Final fallback step: build a value from the structured failure payload.
    pub fn set_payload_renderer<F>(&self, renderer: F)
    where
        F: Fn(&FallbackPayload) -> Result<T, FallbackError> + Send + Sync + 'static,
    {
        self.shared.fallback.set_payload_renderer(renderer);
    }

    pub fn fallback(&self) -> &FallbackChain<T, E> {
        &self.shared.fallback
    }

    /// Operator override: short-circuit every call until [`reset`](Self::reset).
    pub fn force_open(&self) {
        self.force(BreakerState::ForcedOpen);
    }

    /// Operator override: admit every call and never trip until [`reset`](Self::reset).
    pub fn force_closed(&self) {
        self.force(BreakerState::ForcedClosed);
    }

    fn force(&self, to: BreakerState) {
        let now = self.shared.clock.now_millis();
        let transition = {
            let mut core = self.shared.core.lock();
            (core.state != to).then(|| core.transition(to, Cause::Forced, now))
        };
        if let Some(t) = transition {
            self.announce(&t);
        }
    }

    /// Return to CLOSED with an empty window and zeroed counters, from any state.
    pub fn reset(&self) {
        let now = self.shared.clock.now_millis();
        let transition = {
            let mut core = self.shared.core.lock();
            let transition = (core.state != BreakerState::Closed)
                .then(|| core.transition(BreakerState::Closed, Cause::Reset, now));
            core.window.clear();
            core.consecutive_failures = 0;
            core.consecutive_successes = 0;
            core.failure_threshold = self.shared.config.failure_threshold;
            transition
        };
        if let Some(t) = transition {
            self.announce(&t);
        }
        self.publish_threshold(self.shared.config.failure_threshold);
    }

    /// Periodic maintenance: promote an expired OPEN breaker to HALF_OPEN and, when
    /// adaptive tuning is configured, recompute the failure threshold.
    pub fn health_check(&self) -> HealthCheckReport {
        let now = self.shared.clock.now_millis();
        let recovery = millis(self.shared.config.recovery_timeout);
        let (promotion, current, profile) = {
            let mut core = self.shared.core.lock();
            let promotion = (core.state == BreakerState::Open
                && now.saturating_sub(core.changed_at) >= recovery)
                .then(|| core.transition(BreakerState::HalfOpen, Cause::RecoveryElapsed, now));
            (promotion, core.failure_threshold, core.window.profile())
        };
        if let Some(t) = &promotion {
            self.announce(t);
        }

        let mut after = current;
        if let Some(adaptive) = &self.shared.config.adaptive {
            let input = TuningInput {
                current,
                base: self.shared.config.failure_threshold,
                config: adaptive,
                profile,
            };
            let proposed = next_threshold(&*self.shared.tuner, &input);
            if proposed != current {
                let (applied, threshold) = {
                    let mut core = self.shared.core.lock();
                    // a reset or another tick may have moved the threshold since it was read
                    if core.failure_threshold == current {
                        core.failure_threshold = proposed;
                        (true, proposed)
                    } else {
                        (false, core.failure_threshold)
                    }
                };
                after = threshold;
                if applied {
                    tracing::info!(
                        breaker = %self.shared.name,
                        from = current,
                        to = after,
                        dominant = ?profile.dominant(),
                        "adjusted failure threshold"
                    );
                    self.publish_threshold(after);
                } else {
                    tracing::debug!(
                        breaker = %self.shared.name,
                        proposed,
                        "threshold moved while tuning; proposal dropped"
                    );
                }
            }
        }

        HealthCheckReport {
            name: self.shared.name.clone(),
            state: self.state(),
            promoted: promotion.is_some(),
            threshold_before: current,
            threshold_after: after,
        }
    }

    fn admit(&self) -> Result<Ticket<'_>, ResilienceError<E>> {
        self.shared.total_calls.fetch_add(1, Ordering::Relaxed);
        let now = self.shared.clock.now_millis();
        let recovery = millis(self.shared.config.recovery_timeout);
        let mut promotion = None;

        let decision = {
            let mut core = self.shared.core.lock();
            let open_for = Duration::from_millis(now.saturating_sub(core.changed_at));
            let state = core.state;
            match state {
                BreakerState::Closed | BreakerState::ForcedClosed => Ok(None),
                BreakerState::ForcedOpen => Err((BreakerState::ForcedOpen, open_for)),
                BreakerState::Open if now.saturating_sub(core.changed_at) < recovery => {
                    Err((BreakerState::Open, open_for))
                }
                BreakerState::Open => {
                    promotion =
                        Some(core.transition(BreakerState::HalfOpen, Cause::RecoveryElapsed, now));
                    core.half_open_in_flight = 1;
                    Ok(Some(core.epoch))
                }
                BreakerState::HalfOpen => {
                    if core.half_open_in_flight < self.shared.config.half_open_max_calls {
                        core.half_open_in_flight += 1;
                        Ok(Some(core.epoch))
                    } else {
                        Err((BreakerState::HalfOpen, open_for))
                    }
                }
            }
        };

        if let Some(t) = &promotion {
            self.announce(t);
        }

        let probe = match decision {
            Ok(epoch) => epoch.map(|epoch| ProbeSlot { core: &self.shared.core, epoch, armed: true }),
            Err((state, open_for)) => {
                self.shared.short_circuited_calls.fetch_add(1, Ordering::Relaxed);
                let reason = match state {
                    BreakerState::ForcedOpen => "forced_open",
                    BreakerState::HalfOpen => "half_open_saturated",
                    _ => "circuit_open",
                };
                self.shared.metrics.increment_counter(
                    names::REJECTED_TOTAL,
                    &[("breaker", self.shared.name.as_str()), ("reason", reason)],
                );
                return Err(ResilienceError::CircuitOpen {
                    breaker: self.shared.name.clone(),
                    state,
                    open_for,
                });
            }
        };
        if probe.is_some() {
            tracing::debug!(
                breaker = %self.shared.name,
                max = self.shared.config.half_open_max_calls,
                "admitting half-open probe"
            );
        }

        match self.shared.gate.try_admit() {
            Ok(permit) => Ok(Ticket { probe, permit: Some(permit) }),
            Err(rejected) => {
                self.shared.rejected_calls.fetch_add(1, Ordering::Relaxed);
                self.shared.metrics.increment_counter(
                    names::REJECTED_TOTAL,
                    &[("breaker", self.shared.name.as_str()), ("reason", "max_concurrent")],
                );
                tracing::debug!(
                    breaker = %self.shared.name,
                    in_flight = rejected.in_flight,
                    max = rejected.max,
                    "admission rejected"
                );
                Err(ResilienceError::Rejected {
                    breaker: self.shared.name.clone(),
                    in_flight: rejected.in_flight,
                    max: rejected.max,
                })
            }
        }
    }

    fn finish(
        &self,
        ticket: Ticket<'_>,
        key: Option<&FallbackKey>,
        elapsed: Duration,
        result: &Result<T, ResilienceError<E>>,
    ) {
        let now = self.shared.clock.now_millis();
        let (outcome, label) = match result {
            Ok(_) => (Outcome::success(elapsed, now), "success"),
            Err(ResilienceError::Timeout { .. }) => {
                (Outcome::failure(FailureCategory::Timeout, elapsed, now), "timeout")
            }
            Err(ResilienceError::Inner(err)) => {
                (Outcome::failure(self.shared.classifier.classify(err), elapsed, now), "failure")
            }
            Err(_) => (Outcome::failure(FailureCategory::Unknown, elapsed, now), "failure"),
        };
        self.record(ticket, outcome);

        let labels = [("breaker", self.shared.name.as_str()), ("result", label)];
        self.shared.metrics.increment_counter(names::CALLS_TOTAL, &labels);
        self.shared.metrics.record_histogram(
            names::CALL_DURATION_MS,
            elapsed.as_secs_f64() * 1_000.0,
            &labels[..1],
        );

        if let (Ok(value), Some(key)) = (result, key) {
            self.shared.fallback.store(key, value);
        }
    }

    fn record(&self, mut ticket: Ticket<'_>, outcome: Outcome) {
        let now = outcome.timestamp_millis;
        let transition = {
            let mut core = self.shared.core.lock();
            let probing = match ticket.probe.as_mut() {
                Some(probe) => probe.release(&mut core),
                None => false,
            };
            core.window.push(outcome);

            if outcome.success {
                core.consecutive_failures = 0;
                core.consecutive_successes += 1;
                if probing {
                    core.half_open_successes += 1;
                    let successes = core.half_open_successes;
                    if successes >= self.shared.config.success_threshold {
                        let t = core.transition(
                            BreakerState::Closed,
                            Cause::ProbesSucceeded { successes },
                            now,
                        );
                        core.window.clear();
                        core.consecutive_failures = 0;
                        Some(t)
                    } else {
                        None
                    }
                } else {
                    None
                }
            } else {
                core.consecutive_successes = 0;
                core.consecutive_failures += 1;
                let state = core.state;
                match state {
                    BreakerState::Closed => self.trip_cause(&core).map(|cause| {
                        core.transition(BreakerState::Open, cause, now)
                    }),
                    BreakerState::HalfOpen => {
                        Some(core.transition(BreakerState::Open, Cause::ProbeFailed, now))
                    }
                    BreakerState::Open | BreakerState::ForcedOpen | BreakerState::ForcedClosed => {
                        None
                    }
                }
            }
        };
        drop(ticket);

        if let Some(t) = &transition {
            self.announce(t);
        }
    }

    fn trip_cause(&self, core: &Core) -> Option<Cause> {
        if core.consecutive_failures >= core.failure_threshold {
            return Some(Cause::ConsecutiveFailures {
                failures: core.consecutive_failures,
                threshold: core.failure_threshold,
            });
        }
        let threshold = self.shared.config.error_percentage_threshold;
        let percentage = core.window.error_percentage();
        if core.window.len() >= self.shared.config.minimum_calls && percentage >= threshold {
            return Some(Cause::ErrorPercentage { percentage, threshold });
        }
        None
    }

    fn announce(&self, t: &Transition) {
        let name = self.shared.name.as_str();
        match (t.from, t.to, t.cause) {
            (_, BreakerState::Open, Cause::ConsecutiveFailures { failures, threshold }) => {
                tracing::error!(breaker = name, failures, threshold, "circuit breaker → open");
            }
            (_, BreakerState::Open, Cause::ErrorPercentage { percentage, threshold }) => {
                tracing::error!(
                    breaker = name,
                    error_percentage = percentage,
                    threshold,
                    "circuit breaker → open"
                );
            }
            (_, BreakerState::Open, _) => {
                tracing::warn!(breaker = name, "circuit breaker: probe failed → open");
            }
            (_, BreakerState::HalfOpen, _) => {
                tracing::info!(breaker = name, "circuit breaker → half-open");
            }
            (_, _, Cause::ProbesSucceeded { successes }) => {
                tracing::info!(breaker = name, successes, "circuit breaker → closed");
            }
            (from, to, Cause::Forced) => {
                tracing::warn!(breaker = name, %from, %to, "circuit breaker state forced");
            }
            (from, _, _) => {
                tracing::info!(breaker = name, %from, "circuit breaker reset");
            }
        }
        self.shared.metrics.increment_counter(
            names::TRANSITIONS_TOTAL,
            &[("breaker", name), ("from", t.from.as_str()), ("to", t.to.as_str())],
        );
        self.publish_state(t.to);
    }

    fn publish_state(&self, state: BreakerState) {
        self.shared.metrics.set_gauge(
            names::STATE,
            state.as_gauge(),
            &[("breaker", self.shared.name.as_str())],
        );
    }

    fn publish_threshold(&self, threshold: usize) {
        self.shared.metrics.set_gauge(
            names::FAILURE_THRESHOLD,
            threshold as f64,
            &[("breaker", self.shared.name.as_str())],
        );
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
