//! Named breakers for operator control.
//!
//! The registry stores type-erased [`BreakerControl`] handles, so breakers guarding
//! different `T`/`E` pairs can be listed, forced and reset side by side. It is an explicit
//! value passed to whoever needs it; there is no process-wide default.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::circuit_breaker::{BreakerState, BreakerStats, CircuitBreaker, HealthCheckReport};

/// Operations available on a breaker without knowing its call types.
pub trait BreakerControl: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> BreakerState;
    fn stats(&self) -> BreakerStats;
    fn force_open(&self);
    fn force_closed(&self);
    fn reset(&self);
    fn health_check(&self) -> HealthCheckReport;
}

impl<T, E> BreakerControl for CircuitBreaker<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        CircuitBreaker::name(self)
    }

    fn state(&self) -> BreakerState {
        CircuitBreaker::state(self)
    }

    fn stats(&self) -> BreakerStats {
        CircuitBreaker::stats(self)
    }

    fn force_open(&self) {
        CircuitBreaker::force_open(self)
    }

    fn force_closed(&self) {
        CircuitBreaker::force_closed(self)
    }

    fn reset(&self) {
        CircuitBreaker::reset(self)
    }

    fn health_check(&self) -> HealthCheckReport {
        CircuitBreaker::health_check(self)
    }
}

/// Errors from registry lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("circuit breaker '{name}' not found")]
    NotFound { name: String },
    #[error("circuit breaker '{name}' is already registered")]
    AlreadyRegistered { name: String },
}

/// In-memory registry keyed by breaker name. Clones share the same map.
#[derive(Default, Clone, Debug)]
pub struct BreakerRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn BreakerControl>>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker under its own name, replacing any previous entry.
    pub fn register<B: BreakerControl + 'static>(&self, breaker: B) {
        self.register_shared(Arc::new(breaker));
    }

    pub fn register_shared(&self, handle: Arc<dyn BreakerControl>) {
        let name = handle.name().to_owned();
        let mut map = self.inner.write();
        if map.contains_key(&name) {
            warn!(target: "tripwire::registry", breaker = %name, "circuit breaker name replaced; last registration wins");
        }
        map.insert(name, handle);
    }

    /// Register only if the name is free.
    pub fn try_register<B: BreakerControl + 'static>(&self, breaker: B) -> Result<(), RegistryError> {
        let name = breaker.name().to_owned();
        let mut map = self.inner.write();
        if map.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered { name });
        }
        map.insert(name, Arc::new(breaker));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BreakerControl>> {
        self.inner.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn BreakerControl>> {
        self.inner.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn reset(&self, name: &str) -> Result<(), RegistryError> {
        self.with(name, |b| b.reset())
    }

    pub fn force_open(&self, name: &str) -> Result<(), RegistryError> {
        self.with(name, |b| b.force_open())
    }

    pub fn force_closed(&self, name: &str) -> Result<(), RegistryError> {
        self.with(name, |b| b.force_closed())
    }

    /// Reset every registered breaker.
    pub fn reset_all(&self) {
        for handle in self.handles() {
            handle.reset();
        }
    }

    /// Stats for every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> = self.handles().iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Run one health check per breaker, sorted by name.
    pub fn health_check_all(&self) -> Vec<HealthCheckReport> {
        let mut reports: Vec<HealthCheckReport> =
            self.handles().iter().map(|b| b.health_check()).collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Cloned handles, so callers never run breaker code under the registry lock.
    pub(crate) fn handles(&self) -> Vec<Arc<dyn BreakerControl>> {
        self.inner.read().values().cloned().collect()
    }

    fn with(&self, name: &str, f: impl FnOnce(&dyn BreakerControl)) -> Result<(), RegistryError> {
        let handle = self.get(name).ok_or_else(|| RegistryError::NotFound { name: name.to_owned() })?;
        f(&*handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn breaker(name: &str) -> CircuitBreaker<String, std::io::Error> {
        CircuitBreaker::new(name, CircuitBreakerConfig::default()).unwrap()
    }

    #[test]
    fn register_warns_and_replaces_duplicates() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = BreakerRegistry::new();
        let first = breaker("payments");
        registry.register(first.clone());
        let second = breaker("payments");
        registry.register(second.clone());

        // last registration wins
        second.force_open();
        assert_eq!(registry.get("payments").unwrap().state(), BreakerState::ForcedOpen);
        assert_eq!(first.state(), BreakerState::Closed);

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("circuit breaker name replaced"), "warning should be emitted on duplicate registration");
    }

    #[test]
    fn operator_actions_by_name() {
        let registry = BreakerRegistry::new();
        let users = breaker("users");
        registry.register(users.clone());

        registry.force_open("users").unwrap();
        assert_eq!(users.state(), BreakerState::ForcedOpen);
        registry.force_closed("users").unwrap();
        assert_eq!(users.state(), BreakerState::ForcedClosed);
        registry.reset("users").unwrap();
        assert_eq!(users.state(), BreakerState::Closed);

        assert_eq!(
            registry.reset("missing"),
            Err(RegistryError::NotFound { name: "missing".into() })
        );
    }

    #[test]
    fn snapshot_is_sorted_across_types() {
        let registry = BreakerRegistry::new();
        registry.register(breaker("zeta"));
        let numbers: CircuitBreaker<u64, String> =
            CircuitBreaker::new("alpha", CircuitBreakerConfig::default()).unwrap();
        registry.register(numbers);

        let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
        assert_eq!(registry.names(), names);
        assert_eq!(registry.health_check_all().len(), 2);

        registry.force_open("zeta").unwrap();
        registry.reset_all();
        assert!(registry.snapshot().iter().all(|s| s.state == BreakerState::Closed));

        assert_eq!(
            registry.try_register(breaker("zeta")),
            Err(RegistryError::AlreadyRegistered { name: "zeta".into() })
        );
        assert!(registry.remove("zeta").is_some());
        assert_eq!(registry.len(), 1);
    }
}
