//! Retry orchestration through a circuit breaker
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Every attempt goes through the orchestrator's breaker, so breaker state is
//!   authoritative: once the breaker is OPEN or FORCED_OPEN, or an attempt is
//!   short-circuited, the loop stops instead of burning attempts.
//! - Operation errors are retried when the custom `retry_if` predicate says so or, without
//!   one, when their classified category is listed in `retry_on`. Breaker timeouts are
//!   retried when `retry_on_timeout` is set. Successful values can request a retry through
//!   the `retry_on_result` predicate.
//! - When the loop stops on an error, the breaker's fallback chain gets a chance to answer;
//!   otherwise the last error is returned. When it stops because attempts ran out while the
//!   result predicate still wanted a retry, the last value is returned.
//! - Delays come from the configured [`RetryStrategy`], are jittered proportionally and
//!   clamped to `[0, max_delay]`. No lock is held while sleeping.
//!
//! ```rust
//! use std::time::Duration;
//! use tripwire::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryOrchestrator, RetryStrategy};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let breaker: CircuitBreaker<u32, std::io::Error> =
//!     CircuitBreaker::new("inventory", CircuitBreakerConfig::default()).unwrap();
//! let retry = RetryOrchestrator::new(
//!     RetryConfig {
//!         max_attempts: 3,
//!         strategy: RetryStrategy::Constant,
//!         base_delay: Duration::from_millis(1),
//!         ..Default::default()
//!     },
//!     breaker,
//! )
//! .unwrap();
//!
//! let stock = retry.execute(|| async { Ok(12) }).await.unwrap();
//! assert_eq!(stock, 12);
//! # }
//! ```

use crate::backoff::{Backoff, RetryStrategy};
use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::error::{ConfigError, ResilienceError};
use crate::fallback::FallbackKey;
use crate::jitter::Jitter;
use crate::metrics::names;
use crate::outcome::FailureCategory;
use crate::sleeper::{Sleeper, TokioSleeper};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Delays kept in [`RetryMetrics::delays`]; older ones are dropped.
pub const MAX_RECORDED_DELAYS: usize = 1_024;

/// Retry configuration. Immutable once the orchestrator is built.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryConfig {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: usize,
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor for [`RetryStrategy::Exponential`].
    pub multiplier: f64,
    /// Proportional jitter in `[0, 1]`.
    pub jitter_factor: f64,
    /// Per-attempt deadline; the tighter of this and the breaker's timeout applies.
    pub timeout_per_attempt: Option<Duration>,
    /// Failure categories worth retrying when no `retry_if` predicate is set.
    pub retry_on: Vec<FailureCategory>,
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.0,
            timeout_per_attempt: None,
            retry_on: vec![
                FailureCategory::Timeout,
                FailureCategory::Connection,
                FailureCategory::RateLimit,
                FailureCategory::Unknown,
            ],
            retry_on_timeout: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(self.max_attempts));
        }
        Jitter::proportional(self.jitter_factor)?;
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::InvalidMultiplier(self.multiplier));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::InvalidDelayBounds { base: self.base_delay, max: self.max_delay });
        }
        if self.timeout_per_attempt.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidAttemptTimeout);
        }
        if matches!(&self.strategy, RetryStrategy::Custom(table) if table.is_empty()) {
            return Err(ConfigError::EmptyCustomDelays);
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.strategy.clone(), self.base_delay, self.max_delay, self.multiplier)
    }
}

/// Counters kept by one orchestrator since creation or the last reset.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryMetrics {
    /// `execute*` invocations.
    pub executions: u64,
    /// Attempts across all executions, short-circuited ones included.
    pub total_attempts: u64,
    /// Attempts that returned a value.
    pub successes: u64,
    /// Attempts whose operation failed or timed out.
    pub failures: u64,
    pub failures_by_reason: BTreeMap<FailureCategory, u64>,
    /// Attempts refused by the breaker.
    pub short_circuits: u64,
    /// Executions that ended with a fallback value.
    pub fallbacks: u64,
    /// Most recent backoff delays, oldest first.
    pub delays: VecDeque<Duration>,
    pub total_delay: Duration,
}

type ErrorPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type ResultPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Inner<T, E> {
    config: RetryConfig,
    backoff: Backoff,
    jitter: Jitter,
    breaker: CircuitBreaker<T, E>,
    retry_if: Option<ErrorPredicate<E>>,
    retry_on_result: Option<ResultPredicate<T>>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Mutex<RetryMetrics>,
}

/// Retry loop bound to one breaker. Clones share metrics.
pub struct RetryOrchestrator<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for RetryOrchestrator<T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> fmt::Debug for RetryOrchestrator<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("config", &self.inner.config)
            .field("breaker", &self.inner.breaker)
            .field("sleeper", &self.inner.sleeper)
            .field("retry_if", &self.inner.retry_if.as_ref().map(|_| "<predicate>"))
            .field("retry_on_result", &self.inner.retry_on_result.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

/// Builder for `RetryOrchestrator`.
pub struct RetryOrchestratorBuilder<T, E> {
    config: RetryConfig,
    breaker: CircuitBreaker<T, E>,
    retry_if: Option<ErrorPredicate<E>>,
    retry_on_result: Option<ResultPredicate<T>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<T, E> RetryOrchestratorBuilder<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Decide retryability of operation errors directly, bypassing `retry_on`.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Retry even though the operation succeeded, e.g. on an empty or "pending" answer.
    pub fn retry_on_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.retry_on_result = Some(Arc::new(predicate));
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryOrchestrator<T, E>, ConfigError> {
        self.config.validate()?;
        let jitter = Jitter::proportional(self.config.jitter_factor)?;
        Ok(RetryOrchestrator {
            inner: Arc::new(Inner {
                backoff: self.config.backoff(),
                jitter,
                config: self.config,
                breaker: self.breaker,
                retry_if: self.retry_if,
                retry_on_result: self.retry_on_result,
                sleeper: self.sleeper,
                metrics: Mutex::new(RetryMetrics::default()),
            }),
        })
    }
}

enum Step<T, E> {
    Done(Result<T, ResilienceError<E>>),
    Retry(Duration),
}

impl<T, E> RetryOrchestrator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(config: RetryConfig, breaker: CircuitBreaker<T, E>) -> Result<Self, ConfigError> {
        Self::builder(config, breaker).build()
    }

    pub fn builder(config: RetryConfig, breaker: CircuitBreaker<T, E>) -> RetryOrchestratorBuilder<T, E> {
        RetryOrchestratorBuilder {
            config,
            breaker,
            retry_if: None,
            retry_on_result: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    pub fn breaker(&self) -> &CircuitBreaker<T, E> {
        &self.inner.breaker
    }

    pub fn metrics(&self) -> RetryMetrics {
        self.inner.metrics.lock().clone()
    }

    pub fn reset_metrics(&self) {
        *self.inner.metrics.lock() = RetryMetrics::default();
    }

    /// Whether another attempt should follow attempt number `attempt` (1-based).
    ///
    /// False once attempts are used up, while the breaker is OPEN or FORCED_OPEN, and for
    /// errors the breaker produced without running the operation.
    pub fn should_retry(
        &self,
        attempt: usize,
        last_error: Option<&ResilienceError<E>>,
        last_result: Option<&T>,
        timed_out: bool,
    ) -> bool {
        if attempt >= self.inner.config.max_attempts {
            return false;
        }
        if matches!(self.inner.breaker.state(), BreakerState::Open | BreakerState::ForcedOpen) {
            return false;
        }
        let by_error = match last_error {
            Some(ResilienceError::CircuitOpen { .. })
            | Some(ResilienceError::Rejected { .. })
            | Some(ResilienceError::FallbackExhausted { .. }) => return false,
            Some(ResilienceError::Timeout { .. }) => self.inner.config.retry_on_timeout,
            Some(ResilienceError::Inner(err)) => match &self.inner.retry_if {
                Some(predicate) => predicate(err),
                None => {
                    let category = self.inner.breaker.classifier().classify(err);
                    self.inner.config.retry_on.contains(&category)
                }
            },
            None => false,
        };
        let by_result = match (last_result, &self.inner.retry_on_result) {
            (Some(value), Some(predicate)) => predicate(value),
            _ => false,
        };
        let by_timeout = timed_out && self.inner.config.retry_on_timeout;
        by_error || by_result || by_timeout
    }

    /// Run `operation` with retries; see the module docs for the loop's rules.
    pub async fn execute<F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(None, operation).await
    }

    /// Like [`execute`](Self::execute), with successes cached under `key` for the
    /// cache-first fallback step.
    pub async fn execute_with_key<F, Fut>(
        &self,
        key: &FallbackKey,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(Some(key), operation).await
    }

    async fn run<F, Fut>(&self, key: Option<&FallbackKey>, mut operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.inner.metrics.lock().executions += 1;
        let timeout = self.inner.config.timeout_per_attempt;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.inner.breaker.attempt(key, timeout, || operation()).await;
            match self.step(attempt, key, result) {
                Step::Done(result) => return result,
                Step::Retry(delay) => self.inner.sleeper.sleep(delay).await,
            }
        }
    }

    /// Blocking variant of [`execute`](Self::execute). Each attempt runs on a worker thread
    /// so the per-attempt deadline can be enforced.
    pub fn execute_blocking<F>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        self.run_blocking(None, operation)
    }

    pub fn execute_blocking_with_key<F>(&self, key: &FallbackKey, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        self.run_blocking(Some(key), operation)
    }

    fn run_blocking<F>(&self, key: Option<&FallbackKey>, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        self.inner.metrics.lock().executions += 1;
        let operation = Arc::new(operation);
        let timeout = self.inner.config.timeout_per_attempt;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let op = operation.clone();
            let result = self.inner.breaker.attempt_blocking(key, timeout, move || op());
            match self.step(attempt, key, result) {
                Step::Done(result) => return result,
                Step::Retry(delay) => self.inner.sleeper.sleep_blocking(delay),
            }
        }
    }

    /// Account for one attempt and decide what happens next.
    fn step(
        &self,
        attempt: usize,
        key: Option<&FallbackKey>,
        result: Result<T, ResilienceError<E>>,
    ) -> Step<T, E> {
        let breaker = self.inner.breaker.name();
        let sink = self.inner.breaker.metrics_sink();
        sink.increment_counter(names::RETRY_ATTEMPTS_TOTAL, &[("breaker", breaker)]);
        self.record_attempt(&result);

        match result {
            Ok(value) => {
                if self.should_retry(attempt, None, Some(&value), false) {
                    return Step::Retry(self.schedule(attempt, "result"));
                }
                self.finish(if attempt > 1 { "success_after_retry" } else { "success" });
                Step::Done(Ok(value))
            }
            Err(err) => {
                let timed_out = err.is_timeout();
                if self.should_retry(attempt, Some(&err), None, timed_out) {
                    return Step::Retry(self.schedule(attempt, if timed_out { "timeout" } else { "error" }));
                }
                let label = if err.is_short_circuit() || self.breaker_refusing() {
                    "short_circuited"
                } else if attempt >= self.inner.config.max_attempts {
                    "exhausted"
                } else {
                    "not_retryable"
                };
                tracing::debug!(breaker, attempt, outcome = label, "retry loop stopped");
                let resolved = self.inner.breaker.resolve_fallback(key, err);
                if resolved.is_ok() {
                    self.inner.metrics.lock().fallbacks += 1;
                }
                self.finish(label);
                Step::Done(resolved)
            }
        }
    }

    fn breaker_refusing(&self) -> bool {
        matches!(self.inner.breaker.state(), BreakerState::Open | BreakerState::ForcedOpen)
    }

    fn record_attempt(&self, result: &Result<T, ResilienceError<E>>) {
        let mut metrics = self.inner.metrics.lock();
        metrics.total_attempts += 1;
        let category = match result {
            Ok(_) => {
                metrics.successes += 1;
                return;
            }
            Err(ResilienceError::CircuitOpen { .. })
            | Err(ResilienceError::Rejected { .. })
            | Err(ResilienceError::FallbackExhausted { .. }) => {
                metrics.short_circuits += 1;
                return;
            }
            Err(ResilienceError::Timeout { .. }) => FailureCategory::Timeout,
            Err(ResilienceError::Inner(err)) => self.inner.breaker.classifier().classify(err),
        };
        metrics.failures += 1;
        *metrics.failures_by_reason.entry(category).or_insert(0) += 1;
    }

    fn schedule(&self, attempt: usize, reason: &'static str) -> Duration {
        let base = self.inner.backoff.delay(attempt);
        let delay = self.inner.jitter.apply(base, self.inner.backoff.max());
        let breaker = self.inner.breaker.name();
        tracing::debug!(
            breaker,
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            reason,
            "scheduling retry"
        );
        self.inner.breaker.metrics_sink().record_histogram(
            names::RETRY_DELAY_MS,
            delay.as_secs_f64() * 1_000.0,
            &[("breaker", breaker)],
        );
        let mut metrics = self.inner.metrics.lock();
        metrics.delays.push_back(delay);
        if metrics.delays.len() > MAX_RECORDED_DELAYS {
            metrics.delays.pop_front();
        }
        metrics.total_delay = metrics.total_delay.saturating_add(delay);
        delay
    }

    fn finish(&self, label: &'static str) {
        self.inner.breaker.metrics_sink().increment_counter(
            names::RETRY_OUTCOMES_TOTAL,
            &[("breaker", self.inner.breaker.name()), ("result", label)],
        );
    }
}
