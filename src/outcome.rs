//! Per-call outcome records.

use std::fmt;
use std::time::Duration;

/// Closed set of failure kinds used for retry predicates and threshold tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FailureCategory {
    /// The call ran past its deadline.
    Timeout,
    /// The dependency could not be reached or dropped the connection.
    Connection,
    /// The dependency asked us to slow down.
    RateLimit,
    /// The dependency answered, but with a domain-level refusal.
    Business,
    /// Anything the classifier could not place.
    Unknown,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 5] = [
        FailureCategory::Timeout,
        FailureCategory::Connection,
        FailureCategory::RateLimit,
        FailureCategory::Business,
        FailureCategory::Unknown,
    ];

    /// Whether a later attempt has a reasonable chance of succeeding.
    pub fn is_transient(self) -> bool {
        !matches!(self, FailureCategory::Business)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::Connection => "connection",
            FailureCategory::RateLimit => "rate_limit",
            FailureCategory::Business => "business",
            FailureCategory::Unknown => "unknown",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            FailureCategory::Timeout => 0,
            FailureCategory::Connection => 1,
            FailureCategory::RateLimit => 2,
            FailureCategory::Business => 3,
            FailureCategory::Unknown => 4,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one executed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Outcome {
    pub success: bool,
    pub duration: Duration,
    /// Breaker clock reading when the call finished.
    pub timestamp_millis: u64,
    /// `None` for successes.
    pub failure_category: Option<FailureCategory>,
}

impl Outcome {
    pub fn success(duration: Duration, timestamp_millis: u64) -> Self {
        Self { success: true, duration, timestamp_millis, failure_category: None }
    }

    pub fn failure(category: FailureCategory, duration: Duration, timestamp_millis: u64) -> Self {
        Self { success: false, duration, timestamp_millis, failure_category: Some(category) }
    }

    pub fn is_failure(&self) -> bool {
        !self.success
    }
}
