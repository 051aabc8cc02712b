//! Proportional jitter to prevent thundering herds
//!
//! `delay' = delay + delay * factor * u` with `u` uniform in `[-1, 1]`, floored at zero and
//! capped at the caller's ceiling. A factor of `0` leaves delays untouched.
//!
//! RNG: `rand`'s thread-local RNG by default; deterministic RNGs can be injected through
//! [`Jitter::apply_with_rng`].

use crate::error::ConfigError;
use rand::{rng, Rng};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Jitter {
    factor: f64,
}

impl Jitter {
    pub fn none() -> Self {
        Self { factor: 0.0 }
    }

    /// `factor` must lie in `[0, 1]`.
    pub fn proportional(factor: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(ConfigError::InvalidJitterFactor(factor));
        }
        Ok(Self { factor })
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn apply(&self, delay: Duration, max: Duration) -> Duration {
        if self.factor == 0.0 {
            return delay.min(max);
        }
        self.apply_with_rng(delay, max, &mut rng())
    }

    /// Apply jitter with a caller-supplied RNG (for testing).
    pub fn apply_with_rng<R: Rng>(
        &self,
        delay: Duration,
        max: Duration,
        rng: &mut R,
    ) -> Duration {
        if self.factor == 0.0 || delay.is_zero() {
            return delay.min(max);
        }
        let u: f64 = rng.random_range(-1.0..=1.0);
        let secs = delay.as_secs_f64() * (1.0 + self.factor * u);
        if !secs.is_finite() || secs <= 0.0 {
            return Duration::ZERO;
        }
        if secs >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn rejects_out_of_range_factor() {
        assert!(Jitter::proportional(-0.1).is_err());
        assert!(Jitter::proportional(1.5).is_err());
        assert!(matches!(Jitter::proportional(f64::NAN), Err(ConfigError::InvalidJitterFactor(_))));
        assert!(Jitter::proportional(1.0).is_ok());
    }

    #[test]
    fn zero_factor_is_identity() {
        let delay = Duration::from_millis(750);
        assert_eq!(Jitter::none().apply(delay, Duration::from_secs(1)), delay);
    }

    #[test]
    fn stays_within_proportional_band() {
        let jitter = Jitter::proportional(0.2).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(1_000);
        for _ in 0..1_000 {
            let d = jitter.apply_with_rng(delay, Duration::from_secs(10), &mut rng);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1_200), "{d:?}");
        }
    }

    #[test]
    fn never_exceeds_ceiling_or_goes_negative() {
        let jitter = Jitter::proportional(1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let ceiling = Duration::from_millis(1_100);
        for _ in 0..1_000 {
            let d = jitter.apply_with_rng(Duration::from_secs(1), ceiling, &mut rng);
            assert!(d <= ceiling);
        }
    }

    #[test]
    fn spreads_values() {
        let jitter = Jitter::proportional(0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let samples: std::collections::HashSet<u128> = (0..50)
            .map(|_| jitter.apply_with_rng(Duration::from_secs(1), Duration::from_secs(5), &mut rng).as_millis())
            .collect();
        assert!(samples.len() > 10);
    }
}
