use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tripwire::{
    CircuitBreaker, CircuitBreakerConfig, InstantSleeper, ResilienceLayer, RetryConfig,
    RetryOrchestrator,
};

use futures::future::Ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceBuilder};

// A simple service that just returns its input.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

// A service that always fails.
#[derive(Clone)]
struct FailingService {
    calls: Arc<AtomicUsize>,
}

impl FailingService {
    fn new() -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)) }
    }
}

impl Service<&'static str> for FailingService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: &'static str) -> Self::Future {
        self.calls.fetch_add(1, Ordering::Relaxed);
        futures::future::ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")))
    }
}

fn breaker(failure_threshold: usize) -> CircuitBreaker<&'static str, std::io::Error> {
    let config = CircuitBreakerConfig {
        failure_threshold,
        recovery_timeout: Duration::from_secs(30),
        ..CircuitBreakerConfig::default()
    };
    CircuitBreaker::new("bench", config).unwrap()
}

fn circuit_breaker_call_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = breaker(10);

    c.bench_function("circuit_breaker_call_success", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(breaker.call(|| async { Ok(black_box("request")) }).await);
        });
    });
}

fn circuit_breaker_open_fast_fail(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = breaker(1);
    breaker.set_static_response("bench", "fallback");
    breaker.force_open();

    c.bench_function("circuit_breaker_open_fast_fail", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(breaker.call(|| async { Ok(black_box("request")) }).await);
        });
    });
}

fn layer_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let retry = |threshold| {
        RetryOrchestrator::builder(RetryConfig { max_attempts: 3, ..RetryConfig::default() }, breaker(threshold))
            .sleeper(InstantSleeper)
            .build()
            .unwrap()
    };

    let echo = ServiceBuilder::new().layer(ResilienceLayer::new(retry(10))).service(EchoService);
    c.bench_function("resilience_layer_success", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = echo.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });

    // Opens on the first failure, so steady state measures the short-circuit path.
    let failing = ServiceBuilder::new().layer(ResilienceLayer::new(retry(1))).service(FailingService::new());
    c.bench_function("resilience_layer_failure", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = failing.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

criterion_group!(benches, circuit_breaker_call_success, circuit_breaker_open_fast_fail, layer_throughput);
criterion_main!(benches);
