//! Per-call deadlines
//!
//! Async calls race the operation against a tokio timer; when the timer wins the operation's
//! future is dropped, which cancels it at its next suspension point. Blocking calls run the
//! operation on a worker thread and wait on a channel with a bounded receive. A blocking
//! operation that overruns keeps running on its thread (it has no cancellation hook) but
//! its result is discarded.

use crate::error::ConfigError;
use std::future::Future;
use std::io;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// The deadline passed before the operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut {
    pub elapsed: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Zero and `Duration::MAX` are rejected.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() || duration == Duration::MAX {
            return Err(ConfigError::InvalidTimeout(duration));
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The tighter of this deadline and `other`.
    pub fn tightened(&self, other: Option<Duration>) -> Self {
        match other {
            Some(d) if !d.is_zero() && d < self.duration => Self { duration: d },
            _ => *self,
        }
    }

    pub async fn run<F>(&self, operation: F) -> Result<F::Output, TimedOut>
    where
        F: Future,
    {
        let start = Instant::now();
        tokio::time::timeout(self.duration, operation)
            .await
            .map_err(|_| TimedOut { elapsed: start.elapsed(), timeout: self.duration })
    }

    /// Run `operation` on a worker thread and wait at most the deadline for it.
    ///
    /// The outer error means no worker thread could be spawned; `operation` is dropped
    /// unrun. A panic inside `operation` is resumed on the calling thread.
    pub fn run_blocking<F, R>(&self, operation: F) -> io::Result<Result<R, TimedOut>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let start = Instant::now();
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = std::thread::Builder::new().name("tripwire-call".into()).spawn(move || {
            let _ = tx.send(operation());
        })?;

        let timed_out = || TimedOut { elapsed: start.elapsed(), timeout: self.duration };
        match rx.recv_timeout(self.duration) {
            Ok(value) => Ok(Ok(value)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(Err(timed_out())),
            Err(mpsc::RecvTimeoutError::Disconnected) => match handle.join() {
                Err(panic) => std::panic::resume_unwind(panic),
                Ok(()) => Ok(Err(timed_out())),
            },
        }
    }
}
