//! Periodic breaker maintenance
//!
//! Each pass calls [`BreakerControl::health_check`] on every watched breaker: expired OPEN
//! breakers move to HALF_OPEN without waiting for traffic, and adaptive thresholds are
//! recomputed. All mutation happens inside the breaker under its own lock.
//!
//! ```rust
//! use std::time::Duration;
//! use tripwire::{BreakerRegistry, HealthMonitor};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = BreakerRegistry::new();
//! let monitor = HealthMonitor::for_registry(registry, Duration::from_secs(30)).unwrap();
//! let handle = monitor.spawn();
//! handle.shutdown().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::circuit_breaker::HealthCheckReport;
use crate::error::ConfigError;
use crate::registry::{BreakerControl, BreakerRegistry};

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Ticker over a set of breakers and, optionally, a registry.
///
/// Registry members are looked up on every pass, so breakers registered after the monitor
/// starts are picked up.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    interval: Duration,
    breakers: Vec<Arc<dyn BreakerControl>>,
    registry: Option<BreakerRegistry>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self { interval: DEFAULT_HEALTH_INTERVAL, breakers: Vec::new(), registry: None }
    }
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidHealthInterval);
        }
        Ok(Self { interval, ..Self::default() })
    }

    pub fn for_registry(registry: BreakerRegistry, interval: Duration) -> Result<Self, ConfigError> {
        let mut monitor = Self::new(interval)?;
        monitor.registry = Some(registry);
        Ok(monitor)
    }

    pub fn watch<B: BreakerControl + 'static>(mut self, breaker: B) -> Self {
        self.breakers.push(Arc::new(breaker));
        self
    }

    pub fn watch_shared(mut self, breaker: Arc<dyn BreakerControl>) -> Self {
        self.breakers.push(breaker);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One maintenance pass.
    pub fn tick(&self) -> Vec<HealthCheckReport> {
        let mut reports: Vec<HealthCheckReport> =
            self.breakers.iter().map(|b| b.health_check()).collect();
        if let Some(registry) = &self.registry {
            reports.extend(registry.handles().iter().map(|b| b.health_check()));
        }
        let promoted = reports.iter().filter(|r| r.promoted).count();
        let retuned = reports.iter().filter(|r| r.threshold_before != r.threshold_after).count();
        tracing::debug!(checked = reports.len(), promoted, retuned, "health check pass");
        reports
    }

    /// Run [`tick`](Self::tick) every interval on the current tokio runtime.
    ///
    /// The first pass happens one interval after spawning. Dropping the handle stops the
    /// task as well.
    pub fn spawn(self) -> HealthMonitorHandle {
        let (tx, mut rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }
            tracing::debug!("health monitor stopped");
        });
        HealthMonitorHandle { shutdown: Some(tx), task }
    }
}

/// Running monitor task.
#[derive(Debug)]
pub struct HealthMonitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HealthMonitorHandle {
    /// Stop the ticker and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = (&mut self.task).await {
            tracing::warn!(error = %err, "health monitor task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
