//! Fallback chain
//!
//! Resolution order, first success wins:
//!
//! 1. cache lookup by [`FallbackKey`] (only with [`FallbackStrategy::CacheFirst`] and a keyed call)
//! 2. named handlers, in registration order
//! 3. the static response, if one is set
//! 4. the payload renderer, which turns a [`FallbackPayload`] into a value
//!
//! A failing step is logged and skipped; it never replaces the error that sent the call
//! into the chain. Panics inside handlers are not caught.

use crate::circuit_breaker::BreakerState;
use crate::clock::{Clock, MonotonicClock};
use crate::error::ResilienceError;
use crate::metrics::{names, MetricsSink};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

/// Error type returned by fallback steps and caches.
pub type FallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Which steps a breaker's chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FallbackStrategy {
    /// Cache lookup first, then handlers, static response and payload.
    CacheFirst,
    /// Handlers, static response and payload; the cache is never read.
    #[default]
    Handlers,
    /// No fallback: the triggering error is returned as is.
    FailFast,
}

/// Why the chain was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FallbackReason {
    CircuitOpen,
    Rejected,
    Timeout,
    Failure,
}

impl FallbackReason {
    pub fn of<E>(error: &ResilienceError<E>) -> Self {
        match error {
            ResilienceError::CircuitOpen { .. } => FallbackReason::CircuitOpen,
            ResilienceError::Rejected { .. } => FallbackReason::Rejected,
            ResilienceError::Timeout { .. } => FallbackReason::Timeout,
            ResilienceError::FallbackExhausted { .. } | ResilienceError::Inner(_) => {
                FallbackReason::Failure
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::CircuitOpen => "circuit_open",
            FallbackReason::Rejected => "rejected",
            FallbackReason::Timeout => "timeout",
            FallbackReason::Failure => "failure",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic cache key derived from an operation name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FallbackKey(String);

impl FallbackKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// `"{operation}:{hash of args}"`. Equal arguments give equal keys within one build.
    pub fn from_parts<A: Hash + ?Sized>(operation: &str, args: &A) -> Self {
        let mut hasher = DefaultHasher::new();
        args.hash(&mut hasher);
        Self(format!("{}:{:016x}", operation, hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FallbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a handler sees when it is asked for a value.
#[derive(Debug)]
pub struct FallbackContext<'a, E> {
    pub breaker: &'a str,
    pub state: BreakerState,
    pub reason: FallbackReason,
    pub key: Option<&'a FallbackKey>,
    pub error: &'a ResilienceError<E>,
    pub timestamp_millis: u64,
}

/// Structured description of a failed call, rendered by the last chain step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FallbackPayload {
    pub breaker: String,
    pub state: BreakerState,
    pub timestamp_millis: u64,
    pub reason: FallbackReason,
    pub message: String,
}

/// Storage used by the cache-first step. Reads and writes may fail; failures are logged
/// and treated as a miss.
pub trait FallbackCache<T>: Send + Sync + fmt::Debug {
    fn get(&self, key: &FallbackKey) -> Result<Option<T>, FallbackError>;
    fn put(&self, key: &FallbackKey, value: T) -> Result<(), FallbackError>;
}

/// Bounded in-process cache with optional TTL. Oldest insertions are evicted first.
#[derive(Debug)]
pub struct MemoryCache<T> {
    capacity: usize,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    entries: Mutex<CacheEntries<T>>,
}

#[derive(Debug)]
struct CacheEntries<T> {
    values: HashMap<FallbackKey, (T, u64)>,
    order: VecDeque<FallbackKey>,
}

impl<T> MemoryCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl: None,
            clock: Arc::new(MonotonicClock::default()),
            entries: Mutex::new(CacheEntries { values: HashMap::new(), order: VecDeque::new() }),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, stored_at: u64, now: u64) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_sub(stored_at) >= ttl.as_millis() as u64,
            None => false,
        }
    }
}

impl<T: Clone + Send + Sync + fmt::Debug> FallbackCache<T> for MemoryCache<T> {
    fn get(&self, key: &FallbackKey) -> Result<Option<T>, FallbackError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let stale = match entries.values.get(key) {
            Some((value, stored_at)) if !self.expired(*stored_at, now) => {
                return Ok(Some(value.clone()))
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            entries.values.remove(key);
            entries.order.retain(|k| k != key);
        }
        Ok(None)
    }

    fn put(&self, key: &FallbackKey, value: T) -> Result<(), FallbackError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        if entries.values.insert(key.clone(), (value, now)).is_none() {
            entries.order.push_back(key.clone());
        }
        while entries.values.len() > self.capacity {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.values.remove(&oldest);
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Named handler invoked with the failure context.
pub type FallbackHandler<T, E> =
    Arc<dyn Fn(&FallbackContext<'_, E>) -> Result<T, FallbackError> + Send + Sync>;

/// Turns the generic payload into a value.
pub type PayloadRenderer<T> = Arc<dyn Fn(&FallbackPayload) -> Result<T, FallbackError> + Send + Sync>;

/// The step that produced a fallback value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackStep {
    Cache,
    Handler(String),
    Static(String),
    Payload,
}

impl FallbackStep {
    /// Metric label; handler and static names are kept out of labels.
    pub fn label(&self) -> &'static str {
        match self {
            FallbackStep::Cache => "cache",
            FallbackStep::Handler(_) => "handler",
            FallbackStep::Static(_) => "static",
            FallbackStep::Payload => "payload",
        }
    }
}

#[derive(Debug)]
pub enum Resolution<T> {
    Resolved { value: T, step: FallbackStep },
    /// Nothing produced a value; `attempted` steps were tried.
    Unresolved { attempted: usize },
}

/// Per-breaker fallback configuration and resolver.
pub struct FallbackChain<T, E> {
    breaker: String,
    strategy: FallbackStrategy,
    cache: Option<Arc<dyn FallbackCache<T>>>,
    handlers: RwLock<Vec<(String, FallbackHandler<T, E>)>>,
    static_response: RwLock<Option<(String, T)>>,
    renderer: RwLock<Option<PayloadRenderer<T>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<T, E> fmt::Debug for FallbackChain<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: Vec<String> = self.handlers.read().iter().map(|(n, _)| n.clone()).collect();
        f.debug_struct("FallbackChain")
            .field("breaker", &self.breaker)
            .field("strategy", &self.strategy)
            .field("cache", &self.cache.is_some())
            .field("handlers", &handlers)
            .field("static_response", &self.static_response.read().as_ref().map(|(n, _)| n.clone()))
            .field("renderer", &self.renderer.read().is_some())
            .finish()
    }
}

impl<T: Clone, E> FallbackChain<T, E> {
    pub fn new(
        breaker: impl Into<String>,
        strategy: FallbackStrategy,
        cache: Option<Arc<dyn FallbackCache<T>>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            breaker: breaker.into(),
            strategy,
            cache,
            handlers: RwLock::new(Vec::new()),
            static_response: RwLock::new(None),
            renderer: RwLock::new(None),
            metrics,
        }
    }

    pub fn strategy(&self) -> FallbackStrategy {
        self.strategy
    }

    /// Add a handler. Re-registering a name replaces that handler in place.
    pub fn register_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&FallbackContext<'_, E>) -> Result<T, FallbackError> + Send + Sync + 'static,
    {
        let name = name.into();
        let handler: FallbackHandler<T, E> = Arc::new(handler);
        let mut handlers = self.handlers.write();
        if let Some(slot) = handlers.iter_mut().find(|(n, _)| *n == name) {
            tracing::warn!(breaker = %self.breaker, handler = %name, "replacing fallback handler");
            slot.1 = handler;
        } else {
            handlers.push((name, handler));
        }
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.read().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn set_static_response(&self, name: impl Into<String>, value: T) {
        *self.static_response.write() = Some((name.into(), value));
    }

    pub fn clear_static_response(&self) {
        *self.static_response.write() = None;
    }

    pub fn set_payload_renderer<F>(&self, renderer: F)
    where
        F: Fn(&FallbackPayload) -> Result<T, FallbackError> + Send + Sync + 'static,
    {
        *self.renderer.write() = Some(Arc::new(renderer));
    }

    /// Record a successful keyed result for later cache-first lookups.
    pub fn store(&self, key: &FallbackKey, value: &T) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put(key, value.clone()) {
                tracing::warn!(breaker = %self.breaker, key = %key, error = %err, "fallback cache write failed");
            }
        }
    }

    /// Walk the chain for one failed or short-circuited call.
    pub fn resolve(&self, ctx: &FallbackContext<'_, E>) -> Resolution<T> {
        if self.strategy == FallbackStrategy::FailFast {
            return Resolution::Unresolved { attempted: 0 };
        }
        let mut attempted = 0;

        if self.strategy == FallbackStrategy::CacheFirst {
            if let (Some(cache), Some(key)) = (&self.cache, ctx.key) {
                attempted += 1;
                match cache.get(key) {
                    Ok(Some(value)) => return self.resolved(value, FallbackStep::Cache),
                    Ok(None) => {
                        tracing::debug!(breaker = %self.breaker, key = %key, "fallback cache miss")
                    }
                    Err(err) => self.step_failed(&FallbackStep::Cache, &*err),
                }
            }
        }

        // Snapshot so handlers run without the registration lock held.
        let handlers: Vec<(String, FallbackHandler<T, E>)> = self.handlers.read().clone();
        for (name, handler) in handlers {
            attempted += 1;
            match handler(ctx) {
                Ok(value) => return self.resolved(value, FallbackStep::Handler(name)),
                Err(err) => self.step_failed(&FallbackStep::Handler(name), &*err),
            }
        }

        let static_response = self.static_response.read().clone();
        if let Some((name, value)) = static_response {
            return self.resolved(value, FallbackStep::Static(name));
        }

        let renderer = self.renderer.read().clone();
        if let Some(render) = renderer {
            attempted += 1;
            let payload = FallbackPayload {
                breaker: self.breaker.clone(),
                state: ctx.state,
                timestamp_millis: ctx.timestamp_millis,
                reason: ctx.reason,
                message: format!(
                    "circuit breaker '{}' could not complete the call ({})",
                    self.breaker, ctx.reason
                ),
            };
            match render(&payload) {
                Ok(value) => return self.resolved(value, FallbackStep::Payload),
                Err(err) => self.step_failed(&FallbackStep::Payload, &*err),
            }
        }

        Resolution::Unresolved { attempted }
    }

    fn resolved(&self, value: T, step: FallbackStep) -> Resolution<T> {
        tracing::debug!(breaker = %self.breaker, step = ?step, "fallback resolved call");
        self.metrics.increment_counter(
            names::FALLBACK_USED_TOTAL,
            &[("breaker", self.breaker.as_str()), ("step", step.label())],
        );
        Resolution::Resolved { value, step }
    }

    fn step_failed(&self, step: &FallbackStep, err: &(dyn std::error::Error + Send + Sync)) {
        tracing::warn!(breaker = %self.breaker, step = ?step, error = %err, "fallback step failed");
        self.metrics.increment_counter(
            names::FALLBACK_FAILURES_TOTAL,
            &[("breaker", self.breaker.as_str()), ("step", step.label())],
        );
    }
}
