//! tower integration
//!
//! [`ResilienceLayer`] wraps any `tower::Service` so every request runs through a
//! [`RetryOrchestrator`] and therefore through its circuit breaker. Requests must be
//! `Clone` because a retry re-issues them.
//!
//! ```rust
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//! use tripwire::{CircuitBreaker, CircuitBreakerConfig, ResilienceLayer, RetryConfig, RetryOrchestrator};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let breaker = CircuitBreaker::new("echo", CircuitBreakerConfig::default()).unwrap();
//! let retry = RetryOrchestrator::new(RetryConfig::default(), breaker).unwrap();
//!
//! let svc = ServiceBuilder::new()
//!     .layer(ResilienceLayer::new(retry))
//!     .service(service_fn(|req: String| async move { Ok::<_, std::io::Error>(req.to_uppercase()) }));
//!
//! assert_eq!(svc.oneshot("hi".to_string()).await.unwrap(), "HI");
//! # }
//! ```

use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

use crate::error::ResilienceError;
use crate::retry::RetryOrchestrator;

/// Layer that routes requests through a retry orchestrator.
#[derive(Debug)]
pub struct ResilienceLayer<T, E> {
    retry: RetryOrchestrator<T, E>,
}

impl<T, E> Clone for ResilienceLayer<T, E> {
    fn clone(&self) -> Self {
        Self { retry: self.retry.clone() }
    }
}

impl<T, E> ResilienceLayer<T, E> {
    pub fn new(retry: RetryOrchestrator<T, E>) -> Self {
        Self { retry }
    }
}

impl<S, T, E> Layer<S> for ResilienceLayer<T, E> {
    type Service = ResilienceService<S, T, E>;

    fn layer(&self, service: S) -> Self::Service {
        ResilienceService { inner: service, retry: self.retry.clone() }
    }
}

/// Middleware produced by [`ResilienceLayer`].
#[derive(Debug)]
pub struct ResilienceService<S, T, E> {
    inner: S,
    retry: RetryOrchestrator<T, E>,
}

impl<S: Clone, T, E> Clone for ResilienceService<S, T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), retry: self.retry.clone() }
    }
}

impl<S, T, E> ResilienceService<S, T, E> {
    pub fn orchestrator(&self) -> &RetryOrchestrator<T, E> {
        &self.retry
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, Req, T, E> Service<Req> for ResilienceService<S, T, E>
where
    S: Service<Req, Response = T, Error = E> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type Response = T;
    type Error = ResilienceError<E>;
    type Future = BoxFuture<'static, Result<T, ResilienceError<E>>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let retry = self.retry.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            retry
                .execute(move || {
                    let svc = inner.clone();
                    let req = req.clone();
                    async move { svc.oneshot(req).await }
                })
                .await
        })
    }
}
