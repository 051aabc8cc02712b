mod common;

use common::test_helpers::{classify, Calls, ServiceError};
use std::sync::Arc;
use std::time::Duration;
use tripwire::metrics::names;
use tripwire::{
    AdaptiveConfig, BreakerFactory, BreakerRegistry, BreakerState, CircuitBreaker,
    CircuitBreakerConfig, ConfigError, HealthMonitor, InMemoryMetrics, ManualClock,
    RegistryError, ResourceProfile,
};

fn factory() -> (BreakerFactory, ManualClock, Arc<InMemoryMetrics>) {
    let clock = ManualClock::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let factory = BreakerFactory::new().with_clock(clock.clone()).with_metrics(metrics.clone());
    (factory, clock, metrics)
}

fn quick_recovery() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn operators_drive_mixed_breakers_by_name() {
    let (factory, _clock, metrics) = factory();
    let payments: CircuitBreaker<String, ServiceError> =
        factory.create_profile("payments", ResourceProfile::ExternalApi).unwrap();
    let ledger: CircuitBreaker<u64, std::io::Error> =
        factory.create_profile("ledger", ResourceProfile::Database).unwrap();
    let _sessions: CircuitBreaker<Vec<u8>, std::io::Error> =
        factory.create_profile("sessions", ResourceProfile::Cache).unwrap();

    let registry = factory.registry();
    assert_eq!(registry.names(), vec!["ledger", "payments", "sessions"]);

    registry.force_open("ledger").unwrap();
    assert_eq!(ledger.state(), BreakerState::ForcedOpen);
    assert!(ledger.try_call(|| async { Ok(1) }).await.unwrap_err().is_circuit_open());

    registry.force_closed("payments").unwrap();
    assert_eq!(payments.state(), BreakerState::ForcedClosed);

    registry.reset_all();
    assert!(registry.snapshot().iter().all(|s| s.state == BreakerState::Closed));
    assert_eq!(
        metrics.counter(names::TRANSITIONS_TOTAL, &[("breaker", "ledger"), ("to", "forced_open")]),
        1
    );

    assert_eq!(
        registry.reset("billing"),
        Err(RegistryError::NotFound { name: "billing".into() })
    );
}

#[tokio::test]
async fn snapshot_reflects_traffic() {
    let (factory, _clock, _metrics) = factory();
    let api: CircuitBreaker<String, ServiceError> = factory.create("api", CircuitBreakerConfig::default()).unwrap();
    let _idle: CircuitBreaker<String, ServiceError> =
        factory.create("idle", CircuitBreakerConfig::default()).unwrap();

    for _ in 0..3 {
        let _ = api.try_call(|| async { Err(ServiceError::Transient) }).await;
    }
    api.try_call(|| async { Ok("ok".to_string()) }).await.unwrap();

    let snapshot = factory.registry().snapshot();
    assert_eq!(snapshot.len(), 2);
    let api_stats = &snapshot[0];
    assert_eq!(api_stats.name, "api");
    assert_eq!(api_stats.total_calls, 4);
    assert_eq!(api_stats.window_size, 4);
    assert_eq!(api_stats.error_percentage, 75.0);
    assert_eq!(snapshot[1].total_calls, 0);
}

#[test]
fn names_are_unique_per_factory() {
    let (factory, _clock, _metrics) = factory();
    let _first: CircuitBreaker<String, ServiceError> = factory.create("orders", quick_recovery()).unwrap();
    let second = factory.create::<String, ServiceError>("orders", quick_recovery());
    assert_eq!(second.unwrap_err(), ConfigError::DuplicateBreaker("orders".into()));
}

#[test]
fn factories_can_share_a_registry() {
    let shared = BreakerRegistry::new();
    let east = BreakerFactory::new().with_registry(shared.clone());
    let west = BreakerFactory::new().with_registry(shared.clone());
    let _a: CircuitBreaker<String, ServiceError> = east.create("east", quick_recovery()).unwrap();
    let _b: CircuitBreaker<String, ServiceError> = west.create("west", quick_recovery()).unwrap();
    assert_eq!(shared.len(), 2);
    assert!(west.create::<String, ServiceError>("east", quick_recovery()).is_err());
}

#[tokio::test]
async fn monitor_sees_breakers_created_after_it() {
    let (factory, clock, _metrics) = factory();
    let monitor = factory.health_monitor(Duration::from_secs(5)).unwrap();
    assert!(monitor.tick().is_empty());

    let late: CircuitBreaker<String, ServiceError> = factory.create("late", quick_recovery()).unwrap();
    let _ = late.try_call(|| async { Err(ServiceError::Transient) }).await;
    assert_eq!(late.state(), BreakerState::Open);

    clock.advance(Duration::from_secs(2));
    let reports = monitor.tick();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].promoted);
    assert_eq!(late.state(), BreakerState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn spawned_monitor_retunes_and_skips_forced_breakers() {
    let (factory, _clock, metrics) = factory();
    let config = CircuitBreakerConfig {
        failure_threshold: 10,
        recovery_timeout: Duration::from_secs(1),
        adaptive: Some(AdaptiveConfig { min_threshold: 2, max_threshold: 20, ..Default::default() }),
        ..Default::default()
    };
    let flaky: CircuitBreaker<String, ServiceError> =
        factory.create_with("flaky", config, |b| b.classify(classify)).unwrap();
    let pinned: CircuitBreaker<String, ServiceError> = factory.create("pinned", quick_recovery()).unwrap();
    pinned.force_open();

    let calls = Calls::new();
    for _ in 0..6 {
        let _ = flaky
            .try_call(|| {
                calls.hit();
                async { Err(ServiceError::Slow) }
            })
            .await;
    }
    assert_eq!(calls.count(), 6);
    assert_eq!(flaky.state(), BreakerState::Closed);
    let before = flaky.stats().failure_threshold;
    assert_eq!(before, 10);

    let handle = factory.health_monitor(Duration::from_secs(5)).unwrap().spawn();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(flaky.stats().failure_threshold, 9, "timeouts dominate, so the threshold drops");
    assert_eq!(pinned.state(), BreakerState::ForcedOpen, "forced states are left alone");
    assert_eq!(
        metrics.gauge(names::FAILURE_THRESHOLD, &[("breaker", "flaky")]),
        Some(flaky.stats().failure_threshold as f64)
    );

    handle.shutdown().await;
}

#[test]
fn zero_interval_is_rejected() {
    assert_eq!(HealthMonitor::new(Duration::ZERO).unwrap_err(), ConfigError::InvalidHealthInterval);
}
