//! Adaptive failure threshold
//!
//! On each health-check tick a breaker hands its current failure profile to a
//! [`ThresholdTuner`], which proposes a new consecutive-failure threshold. The breaker
//! clamps the proposal to the configured bounds before applying it, so a tuner can never
//! push the threshold outside `[min_threshold, max_threshold]`.
//!
//! The default [`CategoryTuner`] reacts to the dominant failure category:
//!
//! - timeouts dominate → lower the threshold (slow dependencies hurt callers, trip sooner)
//! - connection errors dominate → raise the threshold (blips tend to be short-lived)
//! - anything else, or too few failures to judge → drift back toward the configured value

use crate::error::ConfigError;
use crate::outcome::FailureCategory;
use crate::window::FailureProfile;
use std::sync::Arc;

/// Bounds and sensitivity for threshold tuning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdaptiveConfig {
    /// Lowest threshold the tuner may set.
    pub min_threshold: usize,
    /// Highest threshold the tuner may set.
    pub max_threshold: usize,
    /// Failures the window must hold before the dominant category is trusted.
    pub min_failures: usize,
    /// Largest change applied per tick.
    pub step: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self { min_threshold: 2, max_threshold: 20, min_failures: 5, step: 1 }
    }
}

impl AdaptiveConfig {
    /// Check the bounds against the breaker's configured `failure_threshold`.
    pub fn validate(&self, base: usize) -> Result<(), ConfigError> {
        if self.min_threshold == 0
            || self.min_threshold > base
            || base > self.max_threshold
            || self.step == 0
        {
            return Err(ConfigError::InvalidAdaptiveBounds {
                min: self.min_threshold,
                base,
                max: self.max_threshold,
            });
        }
        Ok(())
    }
}

/// Everything a tuner sees on one tick.
#[derive(Debug, Clone, Copy)]
pub struct TuningInput<'a> {
    pub current: usize,
    /// The threshold from the breaker's configuration.
    pub base: usize,
    pub config: &'a AdaptiveConfig,
    pub profile: FailureProfile,
}

/// Pluggable threshold heuristic.
pub trait ThresholdTuner: Send + Sync + std::fmt::Debug {
    /// Propose the next threshold. Out-of-range proposals are clamped by the caller.
    fn tune(&self, input: &TuningInput<'_>) -> usize;
}

impl<T: ThresholdTuner + ?Sized> ThresholdTuner for Arc<T> {
    fn tune(&self, input: &TuningInput<'_>) -> usize {
        (**self).tune(input)
    }
}

/// Nudges the threshold by the dominant failure category.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryTuner;

impl CategoryTuner {
    fn toward(current: usize, target: usize, step: usize) -> usize {
        if current > target {
            current.saturating_sub(step).max(target)
        } else {
            current.saturating_add(step).min(target)
        }
    }
}

impl ThresholdTuner for CategoryTuner {
    fn tune(&self, input: &TuningInput<'_>) -> usize {
        let step = input.config.step;
        if input.profile.failures < input.config.min_failures {
            return Self::toward(input.current, input.base, step);
        }
        match input.profile.dominant() {
            Some(FailureCategory::Timeout) => input.current.saturating_sub(step),
            Some(FailureCategory::Connection) => input.current.saturating_add(step),
            _ => Self::toward(input.current, input.base, step),
        }
    }
}

/// Apply a tuner and clamp its answer to the configured bounds.
pub(crate) fn next_threshold(tuner: &dyn ThresholdTuner, input: &TuningInput<'_>) -> usize {
    tuner.tune(input).clamp(input.config.min_threshold, input.config.max_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;
    use crate::window::SlidingWindow;
    use std::time::Duration;

    fn profile(failures: &[(FailureCategory, usize)]) -> FailureProfile {
        let mut window = SlidingWindow::new(100);
        let mut ts = 0;
        for (category, n) in failures {
            for _ in 0..*n {
                ts += 1;
                window.push(Outcome::failure(*category, Duration::from_millis(1), ts));
            }
        }
        window.profile()
    }

    fn input(current: usize, profile: FailureProfile, config: &AdaptiveConfig) -> TuningInput<'_> {
        TuningInput { current, base: 5, config, profile }
    }

    #[test]
    fn validate_requires_base_inside_bounds() {
        let config = AdaptiveConfig::default();
        assert!(config.validate(5).is_ok());
        assert!(matches!(
            config.validate(25),
            Err(ConfigError::InvalidAdaptiveBounds { base: 25, .. })
        ));
        let zero_min = AdaptiveConfig { min_threshold: 0, ..AdaptiveConfig::default() };
        assert!(zero_min.validate(5).is_err());
    }

    #[test]
    fn timeout_dominant_lowers_threshold() {
        let config = AdaptiveConfig::default();
        let p = profile(&[(FailureCategory::Timeout, 6), (FailureCategory::Connection, 1)]);
        assert_eq!(next_threshold(&CategoryTuner, &input(5, p, &config)), 4);
    }

    #[test]
    fn connection_dominant_raises_threshold() {
        let config = AdaptiveConfig::default();
        let p = profile(&[(FailureCategory::Connection, 6)]);
        assert_eq!(next_threshold(&CategoryTuner, &input(5, p, &config)), 6);
    }

    #[test]
    fn sparse_failures_drift_back_to_base() {
        let config = AdaptiveConfig::default();
        let p = profile(&[(FailureCategory::Timeout, 2)]);
        assert_eq!(next_threshold(&CategoryTuner, &input(8, p, &config)), 7);
        assert_eq!(next_threshold(&CategoryTuner, &input(3, p, &config)), 4);
        assert_eq!(next_threshold(&CategoryTuner, &input(5, p, &config)), 5);
    }

    #[test]
    fn proposals_are_clamped_to_bounds() {
        let config = AdaptiveConfig { min_threshold: 4, max_threshold: 6, ..AdaptiveConfig::default() };
        let timeouts = profile(&[(FailureCategory::Timeout, 10)]);
        assert_eq!(next_threshold(&CategoryTuner, &input(4, timeouts, &config)), 4);

        let conns = profile(&[(FailureCategory::Connection, 10)]);
        assert_eq!(next_threshold(&CategoryTuner, &input(6, conns, &config)), 6);
    }

    #[derive(Debug)]
    struct Wild;
    impl ThresholdTuner for Wild {
        fn tune(&self, _input: &TuningInput<'_>) -> usize {
            usize::MAX
        }
    }

    #[test]
    fn custom_tuners_cannot_escape_bounds() {
        let config = AdaptiveConfig::default();
        let tuner: Arc<dyn ThresholdTuner> = Arc::new(Wild);
        assert_eq!(next_threshold(&tuner, &input(5, FailureProfile::default(), &config)), 20);
    }
}
