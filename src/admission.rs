//! Admission control for concurrent calls
//!
//! A non-blocking semaphore gate: a call either takes a permit immediately or is rejected.
//! Permits are released when the returned guard drops, on success, failure, timeout, or
//! cancellation of the caller's future alike.

use crate::error::ConfigError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Why a call could not be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRejected {
    pub in_flight: usize,
    pub max: usize,
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl AdmissionGate {
    pub fn new(max_concurrent: usize) -> Result<Self, ConfigError> {
        if max_concurrent == 0 || max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidMaxConcurrentCalls {
                provided: max_concurrent,
                max: Semaphore::MAX_PERMITS,
            });
        }
        Ok(Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent })
    }

    /// Take a permit without waiting.
    pub fn try_admit(&self) -> Result<AdmissionPermit, AdmissionRejected> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
            Err(_) => Err(AdmissionRejected { in_flight: self.in_flight(), max: self.max_concurrent }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// Held for the duration of one admitted call.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            AdmissionGate::new(0),
            Err(ConfigError::InvalidMaxConcurrentCalls { provided: 0, .. })
        ));
    }

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let gate = AdmissionGate::new(2).unwrap();
        let first = gate.try_admit().unwrap();
        let _second = gate.try_admit().unwrap();
        assert_eq!(gate.in_flight(), 2);

        let rejected = gate.try_admit().unwrap_err();
        assert_eq!(rejected, AdmissionRejected { in_flight: 2, max: 2 });

        drop(first);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_admit().is_ok());
    }

    #[tokio::test]
    async fn concurrent_tasks_never_exceed_limit() {
        let gate = AdmissionGate::new(5).unwrap();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let gate = gate.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = gate.try_admit() else {
                    return false;
                };
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                true
            }));
        }

        let results = futures::future::join_all(handles).await;
        let admitted = results.iter().filter(|r| *r.as_ref().unwrap()).count();
        assert!(admitted >= 1);
        assert!(max_seen.load(Ordering::SeqCst) <= 5);
        assert_eq!(gate.in_flight(), 0, "all permits released");
    }
}
