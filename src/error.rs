//! Error types for breaker and retry calls
use crate::circuit_breaker::BreakerState;
use std::fmt;
use std::time::Duration;

/// Typed outcome of a protected call that did not produce a value.
///
/// `E` is the wrapped operation's own error type. Every other variant is produced by the
/// breaker, the admission gate, or the fallback chain.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The operation exceeded its allotted time.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The breaker refused the call without running it (OPEN, FORCED_OPEN, or every
    /// half-open probe slot taken).
    CircuitOpen { breaker: String, state: BreakerState, open_for: Duration },
    /// No admission slot was free.
    Rejected { breaker: String, in_flight: usize, max: usize },
    /// Every fallback step failed and there was no underlying error to surface.
    FallbackExhausted { breaker: String, attempted: usize },
    /// The wrapped operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { breaker, state, open_for } => {
                write!(f, "circuit breaker '{}' is {} (for {:?})", breaker, state, open_for)
            }
            Self::Rejected { breaker, in_flight, max } => write!(
                f,
                "circuit breaker '{}' rejected call ({} in-flight, max {})",
                breaker, in_flight, max
            ),
            Self::FallbackExhausted { breaker, attempted } => {
                if *attempted == 0 {
                    write!(f, "circuit breaker '{}' has no fallback configured", breaker)
                } else {
                    write!(
                        f,
                        "circuit breaker '{}' exhausted {} fallback step(s)",
                        breaker, attempted
                    )
                }
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the breaker refused the call
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if admission control rejected the call
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Check if the fallback chain had nothing to offer
    pub fn is_fallback_exhausted(&self) -> bool {
        matches!(self, Self::FallbackExhausted { .. })
    }

    /// True when the wrapped operation never ran.
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::Rejected { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access timeout details as (elapsed, limit).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Name of the breaker that produced this error, if it came from one.
    pub fn breaker(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { breaker, .. }
            | Self::Rejected { breaker, .. }
            | Self::FallbackExhausted { breaker, .. } => Some(breaker),
            _ => None,
        }
    }

    /// Convert the wrapped error type, leaving resilience variants untouched.
    pub fn map_inner<F, U>(self, f: F) -> ResilienceError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Self::Timeout { elapsed, timeout } => ResilienceError::Timeout { elapsed, timeout },
            Self::CircuitOpen { breaker, state, open_for } => {
                ResilienceError::CircuitOpen { breaker, state, open_for }
            }
            Self::Rejected { breaker, in_flight, max } => {
                ResilienceError::Rejected { breaker, in_flight, max }
            }
            Self::FallbackExhausted { breaker, attempted } => {
                ResilienceError::FallbackExhausted { breaker, attempted }
            }
            Self::Inner(e) => ResilienceError::Inner(f(e)),
        }
    }
}

/// Invalid configuration detected while constructing a breaker or orchestrator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failure_threshold must be > 0 (got {0})")]
    InvalidFailureThreshold(usize),
    #[error("error_percentage_threshold must be in (0, 100] (got {0})")]
    InvalidErrorPercentage(f64),
    #[error("window_size must be > 0 (got {0})")]
    InvalidWindowSize(usize),
    #[error("minimum_calls must be in 1..={window_size} (got {provided})")]
    InvalidMinimumCalls { provided: usize, window_size: usize },
    #[error("recovery_timeout must be > 0 (got {0:?})")]
    InvalidRecoveryTimeout(Duration),
    #[error("success_threshold must be > 0 (got {0})")]
    InvalidSuccessThreshold(usize),
    #[error("half_open_max_calls must be > 0 (got {0})")]
    InvalidHalfOpenLimit(usize),
    #[error("max_concurrent_calls must be in 1..={max} (got {provided})")]
    InvalidMaxConcurrentCalls { provided: usize, max: usize },
    #[error("timeout must be > 0 (got {0:?})")]
    InvalidTimeout(Duration),
    #[error("adaptive bounds must satisfy 0 < min <= failure_threshold <= max (min {min}, base {base}, max {max})")]
    InvalidAdaptiveBounds { min: usize, base: usize, max: usize },
    #[error("fallback strategy cache_first requires a cache")]
    MissingCache,
    #[error("max_attempts must be >= 1 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("jitter_factor must be in [0, 1] (got {0})")]
    InvalidJitterFactor(f64),
    #[error("multiplier must be finite and >= 1 (got {0})")]
    InvalidMultiplier(f64),
    #[error("max_delay ({max:?}) must be >= base_delay ({base:?})")]
    InvalidDelayBounds { base: Duration, max: Duration },
    #[error("timeout_per_attempt must be > 0 when set")]
    InvalidAttemptTimeout,
    #[error("custom retry strategy needs at least one delay")]
    EmptyCustomDelays,
    #[error("health check interval must be > 0")]
    InvalidHealthInterval,
    #[error("a circuit breaker named '{0}' already exists")]
    DuplicateBreaker(String),
}
