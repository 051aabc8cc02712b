//! Fixed-capacity outcome history.
//!
//! Invariants:
//! - `len() <= capacity()` after every operation; the oldest outcome is evicted first.
//! - Timestamps are non-decreasing: an outcome stamped earlier than the newest entry is
//!   re-stamped to the newest entry's time.
//! - Failure totals and per-category counts are maintained incrementally, so rolling error
//!   percentage and the failure profile cost O(1) to read.
//!
//! The window is not synchronized on its own; a breaker mutates it only while holding its
//! state lock, which keeps recording atomic with the transition check that follows.

use crate::outcome::{FailureCategory, Outcome};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    outcomes: VecDeque<Outcome>,
    capacity: usize,
    failures: usize,
    by_category: [usize; 5],
}

impl SlidingWindow {
    /// Create an empty window. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity.min(4_096)),
            capacity,
            failures: 0,
            by_category: [0; 5],
        }
    }

    /// Append an outcome, returning the evicted one when the window was full.
    pub fn push(&mut self, mut outcome: Outcome) -> Option<Outcome> {
        if let Some(last) = self.outcomes.back() {
            if outcome.timestamp_millis < last.timestamp_millis {
                outcome.timestamp_millis = last.timestamp_millis;
            }
        }

        let evicted = if self.outcomes.len() >= self.capacity {
            let old = self.outcomes.pop_front();
            if let Some(old) = &old {
                self.forget(old);
            }
            old
        } else {
            None
        };

        if let Some(category) = outcome.failure_category.filter(|_| outcome.is_failure()) {
            self.by_category[category.index()] += 1;
        }
        if outcome.is_failure() {
            self.failures += 1;
        }
        self.outcomes.push_back(outcome);
        evicted
    }

    fn forget(&mut self, outcome: &Outcome) {
        if outcome.is_failure() {
            self.failures = self.failures.saturating_sub(1);
            if let Some(category) = outcome.failure_category {
                let slot = &mut self.by_category[category.index()];
                *slot = slot.saturating_sub(1);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn failure_count(&self) -> usize {
        self.failures
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.len() - self.failures
    }

    /// Share of failures in the window, 0.0–100.0. An empty window reports 0.
    pub fn error_percentage(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.failures as f64 * 100.0 / self.outcomes.len() as f64
    }

    pub fn category_count(&self, category: FailureCategory) -> usize {
        self.by_category[category.index()]
    }

    pub fn profile(&self) -> FailureProfile {
        FailureProfile {
            total: self.outcomes.len(),
            failures: self.failures,
            by_category: self.by_category,
        }
    }

    pub fn newest(&self) -> Option<&Outcome> {
        self.outcomes.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter()
    }

    pub fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
        self.by_category = [0; 5];
    }
}

/// Snapshot of a window's failure mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailureProfile {
    pub total: usize,
    pub failures: usize,
    by_category: [usize; 5],
}

impl FailureProfile {
    pub fn count(&self, category: FailureCategory) -> usize {
        self.by_category[category.index()]
    }

    /// The category with strictly the most failures; ties and empty profiles give `None`.
    pub fn dominant(&self) -> Option<FailureCategory> {
        let mut best: Option<(FailureCategory, usize)> = None;
        let mut tied = false;
        for category in FailureCategory::ALL {
            let count = self.count(category);
            if count == 0 {
                continue;
            }
            match best {
                Some((_, top)) if count == top => tied = true,
                Some((_, top)) if count < top => {}
                _ => {
                    best = Some((category, count));
                    tied = false;
                }
            }
        }
        if tied {
            None
        } else {
            best.map(|(category, _)| category)
        }
    }
}
