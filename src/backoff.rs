//! Backoff strategies for retry loops.
//!
//! Attempt semantics: `delay(n)` is the pause after the `n`-th failed attempt, so the first
//! retry waits `delay(1)`. `delay(0)` is always zero. Every delay is clamped to
//! `[0, max_delay]`, and intermediate arithmetic saturates at [`MAX_BACKOFF`].
//!
//! ```rust
//! use std::time::Duration;
//! use tripwire::{Backoff, RetryStrategy};
//!
//! let backoff = Backoff::new(
//!     RetryStrategy::Exponential,
//!     Duration::from_millis(100),
//!     Duration::from_secs(2),
//!     2.0,
//! );
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```

use std::time::Duration;

/// Ceiling applied before `max_delay` when a computation would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// How the pause between attempts grows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RetryStrategy {
    /// `base * multiplier^(n-1)`
    #[default]
    Exponential,
    /// `base * n`
    Linear,
    /// `base`
    Constant,
    /// `base * fib(n)` with `fib(1) = fib(2) = 1`
    Fibonacci,
    /// Explicit per-attempt table; attempts past its end wait `max_delay`.
    Custom(Vec<Duration>),
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Constant => "constant",
            RetryStrategy::Fibonacci => "fibonacci",
            RetryStrategy::Custom(_) => "custom",
        }
    }
}

/// A strategy bound to its delay parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    strategy: RetryStrategy,
    base: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(strategy: RetryStrategy, base: Duration, max: Duration, multiplier: f64) -> Self {
        Self { strategy, base, max: max.min(MAX_BACKOFF), multiplier }
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match &self.strategy {
            RetryStrategy::Constant => self.base,
            RetryStrategy::Linear => {
                let n = attempt.min(u32::MAX as usize) as u32;
                self.base.checked_mul(n).unwrap_or(MAX_BACKOFF)
            }
            RetryStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                let factor = self.multiplier.powi(exponent);
                scale(self.base, factor)
            }
            RetryStrategy::Fibonacci => {
                let n = fibonacci(attempt);
                let n = n.min(u32::MAX as u64) as u32;
                self.base.checked_mul(n).unwrap_or(MAX_BACKOFF)
            }
            RetryStrategy::Custom(table) => table.get(attempt - 1).copied().unwrap_or(self.max),
        };
        raw.min(self.max)
    }
}

fn scale(base: Duration, factor: f64) -> Duration {
    let nanos = base.as_nanos() as f64 * factor;
    if !nanos.is_finite() || nanos >= MAX_BACKOFF.as_nanos() as f64 {
        MAX_BACKOFF
    } else if nanos <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// `fib(1) = fib(2) = 1`, saturating.
fn fibonacci(n: usize) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
        if b == u64::MAX {
            break;
        }
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn backoff(strategy: RetryStrategy) -> Backoff {
        Backoff::new(strategy, ms(100), Duration::from_secs(10), 2.0)
    }

    #[test]
    fn attempt_zero_never_waits() {
        for strategy in [
            RetryStrategy::Exponential,
            RetryStrategy::Linear,
            RetryStrategy::Constant,
            RetryStrategy::Fibonacci,
            RetryStrategy::Custom(vec![ms(5)]),
        ] {
            assert_eq!(backoff(strategy).delay(0), Duration::ZERO);
        }
    }

    #[test]
    fn exponential_multiplies_per_attempt() {
        let b = backoff(RetryStrategy::Exponential);
        let delays: Vec<_> = (1..=4).map(|n| b.delay(n)).collect();
        assert_eq!(delays, vec![ms(100), ms(200), ms(400), ms(800)]);

        let gentle = Backoff::new(RetryStrategy::Exponential, ms(100), Duration::from_secs(10), 1.5);
        assert_eq!(gentle.delay(3), ms(225));
    }

    #[test]
    fn linear_and_constant() {
        let linear = backoff(RetryStrategy::Linear);
        assert_eq!(linear.delay(3), ms(300));
        let constant = backoff(RetryStrategy::Constant);
        assert_eq!(constant.delay(1), constant.delay(7));
    }

    #[test]
    fn fibonacci_sequence() {
        let b = backoff(RetryStrategy::Fibonacci);
        let delays: Vec<_> = (1..=6).map(|n| b.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 100, 200, 300, 500, 800]);
    }

    #[test]
    fn custom_table_then_max_delay() {
        let b = backoff(RetryStrategy::Custom(vec![ms(10), ms(50)]));
        assert_eq!(b.delay(1), ms(10));
        assert_eq!(b.delay(2), ms(50));
        assert_eq!(b.delay(3), Duration::from_secs(10));
    }

    #[test]
    fn all_strategies_clamp_to_max_delay() {
        let max = ms(250);
        for strategy in [
            RetryStrategy::Exponential,
            RetryStrategy::Linear,
            RetryStrategy::Fibonacci,
            RetryStrategy::Custom(vec![Duration::from_secs(60)]),
        ] {
            let b = Backoff::new(strategy, ms(100), max, 3.0);
            for n in 1..100 {
                assert!(b.delay(n) <= max);
            }
        }
    }

    #[test]
    fn huge_attempts_saturate() {
        let b = Backoff::new(RetryStrategy::Exponential, Duration::from_secs(1), Duration::MAX, 10.0);
        assert_eq!(b.delay(usize::MAX), MAX_BACKOFF);
        let f = Backoff::new(RetryStrategy::Fibonacci, Duration::from_secs(1), Duration::MAX, 2.0);
        assert_eq!(f.delay(500), MAX_BACKOFF);
    }
}
