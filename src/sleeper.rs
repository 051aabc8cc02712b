//! Backoff sleeping
//!
//! The orchestrator never holds a lock while it sleeps; it hands the delay to a `Sleeper`.
//! Tests swap in `InstantSleeper`/`TrackingSleeper` to observe delays without waiting.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Abstraction for sleeping between retry attempts.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Cooperative sleep for async callers.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Thread sleep for blocking callers.
    fn sleep_blocking(&self, duration: Duration);
}

/// Production sleeper: tokio timer for async, `std::thread::sleep` for blocking callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn sleep_blocking(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Test sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }

    fn sleep_blocking(&self, _duration: Duration) {}
}

/// Test sleeper that records every requested delay and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.calls.lock().iter().sum()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.calls.lock().push(duration);
        Box::pin(async {})
    }

    fn sleep_blocking(&self, duration: Duration) {
        self.calls.lock().push(duration);
    }
}
