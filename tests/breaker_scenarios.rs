mod common;

use common::test_helpers::{harness, Calls, ServiceError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tripwire::metrics::names;
use tripwire::{BreakerState, CircuitBreakerConfig, ResilienceError};

async fn fail(h: &common::test_helpers::Harness) {
    let _ = h.breaker.try_call(|| async { Err(ServiceError::Transient) }).await;
}

async fn succeed(h: &common::test_helpers::Harness) {
    let _ = h.breaker.try_call(|| async { Ok("ok".to_string()) }).await;
}

#[tokio::test]
async fn scenario_a_consecutive_failures_open_the_breaker() {
    let h = harness("a", CircuitBreakerConfig { failure_threshold: 3, ..Default::default() });
    for _ in 0..2 {
        fail(&h).await;
        assert_eq!(h.breaker.state(), BreakerState::Closed);
    }
    fail(&h).await;
    assert_eq!(h.breaker.state(), BreakerState::Open);
    assert_eq!(
        h.metrics.counter(names::TRANSITIONS_TOTAL, &[("from", "closed"), ("to", "open")]),
        1
    );
    assert_eq!(h.metrics.gauge(names::STATE, &[("breaker", "a")]), Some(1.0));
}

#[tokio::test]
async fn scenario_b_recovery_timeout_admits_a_probe() {
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let h = harness("b", config);
    fail(&h).await;
    assert_eq!(h.breaker.state(), BreakerState::Open);

    h.clock.advance(Duration::from_millis(1_100));
    let calls = Calls::new();
    let result = h
        .breaker
        .try_call(|| {
            calls.hit();
            async { Ok("probe".to_string()) }
        })
        .await;
    assert_eq!(result.unwrap(), "probe");
    assert_eq!(calls.count(), 1, "op must execute once the recovery timeout elapsed");
    assert_eq!(h.breaker.state(), BreakerState::HalfOpen);
}

#[tokio::test]
async fn scenario_c_probe_successes_close_the_breaker() {
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        success_threshold: 2,
        recovery_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let h = harness("c", config);
    fail(&h).await;
    h.clock.advance(Duration::from_secs(2));
    h.breaker.health_check();
    assert_eq!(h.breaker.state(), BreakerState::HalfOpen);

    succeed(&h).await;
    assert_eq!(h.breaker.state(), BreakerState::HalfOpen);
    succeed(&h).await;

    let stats = h.breaker.stats();
    assert_eq!(stats.state, BreakerState::Closed);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.window_size, 0);
}

#[tokio::test]
async fn failed_probe_reopens() {
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let h = harness("probe", config);
    fail(&h).await;
    h.clock.advance(Duration::from_secs(1));
    fail(&h).await;
    assert_eq!(h.breaker.state(), BreakerState::Open);

    let calls = Calls::new();
    let err = h
        .breaker
        .try_call(|| {
            calls.hit();
            async { Ok("never".to_string()) }
        })
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(calls.count(), 0);
}

#[tokio::test]
async fn window_never_exceeds_capacity() {
    let config = CircuitBreakerConfig {
        failure_threshold: 1_000,
        error_percentage_threshold: 100.0,
        window_size: 10,
        minimum_calls: 10,
        ..Default::default()
    };
    let h = harness("window", config);
    for i in 0..57 {
        if i % 2 == 0 {
            fail(&h).await;
        } else {
            succeed(&h).await;
        }
        assert!(h.breaker.stats().window_size <= 10);
    }
    assert_eq!(h.breaker.stats().window_size, 10);
    assert_eq!(h.breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn trips_only_when_a_rule_is_met() {
    let config = CircuitBreakerConfig {
        failure_threshold: 5,
        error_percentage_threshold: 50.0,
        window_size: 20,
        minimum_calls: 10,
        ..Default::default()
    };

    // 40% failures, never two in a row
    let steady = harness("steady", config.clone());
    for i in 0..50 {
        if i % 5 == 0 || i % 5 == 3 {
            fail(&steady).await;
        } else {
            succeed(&steady).await;
        }
    }
    assert_eq!(steady.breaker.state(), BreakerState::Closed);

    // alternating failures reach 50% once the window holds enough calls
    let flapping = harness("flapping", config);
    for i in 0..10 {
        if i % 2 == 0 {
            fail(&flapping).await;
        } else {
            succeed(&flapping).await;
        }
    }
    assert_eq!(flapping.breaker.state(), BreakerState::Closed);
    fail(&flapping).await;
    assert_eq!(flapping.breaker.state(), BreakerState::Open);
}

#[tokio::test]
async fn open_breaker_runs_nothing_until_recovery() {
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let h = harness("gate", config);
    fail(&h).await;

    let calls = Calls::new();
    for _ in 0..5 {
        h.clock.advance(Duration::from_millis(199));
        let err = h
            .breaker
            .try_call(|| {
                calls.hit();
                async { Ok("x".to_string()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { state: BreakerState::Open, .. }));
    }
    assert_eq!(calls.count(), 0);
    assert_eq!(h.breaker.stats().short_circuited_calls, 5);

    h.clock.advance(Duration::from_millis(5));
    let _ = h
        .breaker
        .try_call(|| {
            calls.hit();
            async { Ok("x".to_string()) }
        })
        .await;
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn forced_closed_runs_calls_and_never_trips() {
    let h = harness("forced", CircuitBreakerConfig { failure_threshold: 1, ..Default::default() });
    fail(&h).await;
    assert_eq!(h.breaker.state(), BreakerState::Open);

    h.breaker.force_closed();
    for _ in 0..10 {
        fail(&h).await;
    }
    let stats = h.breaker.stats();
    assert_eq!(stats.state, BreakerState::ForcedClosed);
    assert_eq!(stats.failure_count, 11);
}

#[tokio::test]
async fn reset_is_idempotent_from_every_state() {
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let h = harness("reset", config);

    let drive: [fn(&common::test_helpers::Harness); 3] = [
        |h| h.breaker.force_open(),
        |h| h.breaker.force_closed(),
        |_| {},
    ];
    for setup in drive {
        setup(&h);
        h.breaker.reset();
        h.breaker.reset();
        let stats = h.breaker.stats();
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.window_size, 0);
        assert_eq!(stats.failure_count, 0);
    }

    fail(&h).await;
    h.breaker.reset();
    assert_eq!(h.breaker.state(), BreakerState::Closed);

    fail(&h).await;
    h.clock.advance(Duration::from_secs(1));
    h.breaker.health_check();
    assert_eq!(h.breaker.state(), BreakerState::HalfOpen);
    h.breaker.reset();
    assert_eq!(h.breaker.stats().window_size, 0);
    assert_eq!(h.breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn one_call_over_the_limit_goes_to_fallback_without_blocking() {
    const LIMIT: usize = 3;
    let h = harness("pool", CircuitBreakerConfig { max_concurrent_calls: LIMIT, ..Default::default() });
    h.breaker.set_static_response("busy", "try later".to_string());

    let release = Arc::new(Semaphore::new(0));
    let mut tasks = Vec::new();
    for _ in 0..LIMIT {
        let breaker = h.breaker.clone();
        let release = release.clone();
        tasks.push(tokio::spawn(async move {
            breaker
                .call(|| async move {
                    let _permit = release.acquire().await.map_err(|_| ServiceError::Transient)?;
                    Ok("done".to_string())
                })
                .await
        }));
    }
    while h.breaker.stats().in_flight < LIMIT {
        tokio::task::yield_now().await;
    }

    let calls = Calls::new();
    let overflow = tokio::time::timeout(
        Duration::from_secs(1),
        h.breaker.call(|| {
            calls.hit();
            async { Ok("ran".to_string()) }
        }),
    )
    .await
    .expect("rejected call must not wait for a slot");
    assert_eq!(overflow.unwrap(), "try later");
    assert_eq!(calls.count(), 0);

    release.add_permits(LIMIT);
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "done");
    }
    let stats = h.breaker.stats();
    assert_eq!(stats.rejected_calls, 1);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(
        h.metrics.counter(names::REJECTED_TOTAL, &[("reason", "max_concurrent")]),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn timeouts_count_as_failures() {
    let config = CircuitBreakerConfig {
        failure_threshold: 2,
        timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let h = harness("slow", config);
    for _ in 0..2 {
        let err = h
            .breaker
            .try_call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
    assert_eq!(h.breaker.state(), BreakerState::Open);
    assert_eq!(h.metrics.counter(names::CALLS_TOTAL, &[("result", "timeout")]), 2);
}
