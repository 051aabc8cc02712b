//! One breaker per protected resource.
//!
//! `BreakerFactory` owns the collaborators every breaker of an application shares (metrics
//! sink, clock, registry) and hands out breakers by name. Names are unique per factory.
//!
//! ## Resource profiles
//!
//! - [`ResourceProfile::ExternalApi`]: third-party calls. Tolerant breaker, long timeouts,
//!   five attempts with jittered exponential backoff.
//! - [`ResourceProfile::Database`]: strict breaker sized to a typical pool, no retries
//!   (writes are often not idempotent).
//! - [`ResourceProfile::Cache`]: tight timeout, fast recovery, one quick retry.
//!
//! ```rust
//! use tripwire::{BreakerFactory, ResourceProfile};
//!
//! let factory = BreakerFactory::new();
//! let retry = factory
//!     .create_with_retry::<String, std::io::Error>("geocoder", ResourceProfile::ExternalApi)
//!     .unwrap();
//! assert_eq!(retry.config().max_attempts, 5);
//! assert!(factory.registry().contains("geocoder"));
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::RetryStrategy;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig};
use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::health::HealthMonitor;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::registry::BreakerRegistry;
use crate::retry::{RetryConfig, RetryOrchestrator};

const EXTERNAL_API_FAILURE_THRESHOLD: usize = 15;
const EXTERNAL_API_RECOVERY_SECS: u64 = 120;
const EXTERNAL_API_MAX_CONCURRENT: usize = 20;
const EXTERNAL_API_TIMEOUT_SECS: u64 = 15;
const EXTERNAL_API_ATTEMPTS: usize = 5;
const EXTERNAL_API_BACKOFF_MILLIS: u64 = 500;
const EXTERNAL_API_MAX_BACKOFF_SECS: u64 = 30;

const DATABASE_FAILURE_THRESHOLD: usize = 5;
const DATABASE_RECOVERY_SECS: u64 = 60;
const DATABASE_MAX_CONCURRENT: usize = 50;
const DATABASE_TIMEOUT_SECS: u64 = 10;

const CACHE_FAILURE_THRESHOLD: usize = 10;
const CACHE_RECOVERY_SECS: u64 = 10;
const CACHE_MAX_CONCURRENT: usize = 200;
const CACHE_TIMEOUT_MILLIS: u64 = 100;
const CACHE_BACKOFF_MILLIS: u64 = 10;

/// Tuned defaults per kind of protected resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ResourceProfile {
    ExternalApi,
    Database,
    Cache,
}

impl ResourceProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceProfile::ExternalApi => "external_api",
            ResourceProfile::Database => "database",
            ResourceProfile::Cache => "cache",
        }
    }

    pub fn breaker_config(self) -> CircuitBreakerConfig {
        let base = CircuitBreakerConfig::default();
        match self {
            ResourceProfile::ExternalApi => CircuitBreakerConfig {
                failure_threshold: EXTERNAL_API_FAILURE_THRESHOLD,
                recovery_timeout: Duration::from_secs(EXTERNAL_API_RECOVERY_SECS),
                max_concurrent_calls: EXTERNAL_API_MAX_CONCURRENT,
                timeout: Duration::from_secs(EXTERNAL_API_TIMEOUT_SECS),
                ..base
            },
            ResourceProfile::Database => CircuitBreakerConfig {
                failure_threshold: DATABASE_FAILURE_THRESHOLD,
                recovery_timeout: Duration::from_secs(DATABASE_RECOVERY_SECS),
                max_concurrent_calls: DATABASE_MAX_CONCURRENT,
                timeout: Duration::from_secs(DATABASE_TIMEOUT_SECS),
                ..base
            },
            ResourceProfile::Cache => CircuitBreakerConfig {
                failure_threshold: CACHE_FAILURE_THRESHOLD,
                recovery_timeout: Duration::from_secs(CACHE_RECOVERY_SECS),
                max_concurrent_calls: CACHE_MAX_CONCURRENT,
                timeout: Duration::from_millis(CACHE_TIMEOUT_MILLIS),
                success_threshold: 1,
                ..base
            },
        }
    }

    pub fn retry_config(self) -> RetryConfig {
        let base = RetryConfig::default();
        match self {
            ResourceProfile::ExternalApi => RetryConfig {
                max_attempts: EXTERNAL_API_ATTEMPTS,
                strategy: RetryStrategy::Exponential,
                base_delay: Duration::from_millis(EXTERNAL_API_BACKOFF_MILLIS),
                max_delay: Duration::from_secs(EXTERNAL_API_MAX_BACKOFF_SECS),
                jitter_factor: 0.1,
                ..base
            },
            ResourceProfile::Database => RetryConfig { max_attempts: 1, ..base },
            ResourceProfile::Cache => RetryConfig {
                max_attempts: 2,
                strategy: RetryStrategy::Constant,
                base_delay: Duration::from_millis(CACHE_BACKOFF_MILLIS),
                max_delay: Duration::from_millis(CACHE_BACKOFF_MILLIS),
                ..base
            },
        }
    }
}

/// Creates named breakers that share a metrics sink, a clock and a registry.
#[derive(Debug, Clone)]
pub struct BreakerFactory {
    registry: BreakerRegistry,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl Default for BreakerFactory {
    fn default() -> Self {
        Self {
            registry: BreakerRegistry::new(),
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(MonotonicClock::default()),
        }
    }
}

impl BreakerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Register created breakers into an existing registry.
    pub fn with_registry(mut self, registry: BreakerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &BreakerRegistry {
        &self.registry
    }

    pub fn create<T, E>(
        &self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<CircuitBreaker<T, E>, ConfigError>
    where
        T: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.create_with(name, config, |builder| builder)
    }

    /// Like [`create`](Self::create), with a hook to set a classifier, cache or tuner.
    pub fn create_with<T, E, F>(
        &self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        customize: F,
    ) -> Result<CircuitBreaker<T, E>, ConfigError>
    where
        T: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
        F: FnOnce(CircuitBreakerBuilder<T, E>) -> CircuitBreakerBuilder<T, E>,
    {
        let name = name.into();
        if self.registry.contains(&name) {
            return Err(ConfigError::DuplicateBreaker(name));
        }
        let builder = CircuitBreaker::builder(name.clone(), config)
            .shared_clock(self.clock.clone())
            .metrics(self.metrics.clone());
        let breaker = customize(builder).build()?;
        self.registry
            .try_register(breaker.clone())
            .map_err(|_| ConfigError::DuplicateBreaker(name.clone()))?;
        tracing::debug!(breaker = %name, "circuit breaker created");
        Ok(breaker)
    }

    pub fn create_profile<T, E>(
        &self,
        name: impl Into<String>,
        profile: ResourceProfile,
    ) -> Result<CircuitBreaker<T, E>, ConfigError>
    where
        T: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.create(name, profile.breaker_config())
    }

    /// Breaker and orchestrator for `name`, both configured from `profile`.
    pub fn create_with_retry<T, E>(
        &self,
        name: impl Into<String>,
        profile: ResourceProfile,
    ) -> Result<RetryOrchestrator<T, E>, ConfigError>
    where
        T: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let retry = profile.retry_config();
        retry.validate()?;
        let breaker = self.create_profile(name, profile)?;
        RetryOrchestrator::new(retry, breaker)
    }

    /// Monitor over every breaker this factory creates, now or later.
    pub fn health_monitor(&self, interval: Duration) -> Result<HealthMonitor, ConfigError> {
        HealthMonitor::for_registry(self.registry.clone(), interval)
    }
}
