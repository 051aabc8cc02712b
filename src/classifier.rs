//! Explicit mapping from an operation's error to a [`FailureCategory`].
//!
//! Breakers never inspect error types reflectively. Each breaker owns one classifier
//! function; timeouts raised by the breaker itself are always `Timeout` and never reach it.

use crate::outcome::FailureCategory;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Error → category function shared by a breaker and its orchestrator.
pub struct FailureClassifier<E> {
    classify: Arc<dyn Fn(&E) -> FailureCategory + Send + Sync>,
}

impl<E> Clone for FailureClassifier<E> {
    fn clone(&self) -> Self {
        Self { classify: self.classify.clone() }
    }
}

impl<E> fmt::Debug for FailureClassifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureClassifier").field("classify", &"<fn>").finish()
    }
}

impl<E> Default for FailureClassifier<E> {
    fn default() -> Self {
        Self::uniform(FailureCategory::Unknown)
    }
}

impl<E> FailureClassifier<E> {
    pub fn new<F>(classify: F) -> Self
    where
        F: Fn(&E) -> FailureCategory + Send + Sync + 'static,
    {
        Self { classify: Arc::new(classify) }
    }

    /// Put every error in the same category.
    pub fn uniform(category: FailureCategory) -> Self {
        Self { classify: Arc::new(move |_| category) }
    }

    pub fn classify(&self, error: &E) -> FailureCategory {
        (self.classify)(error)
    }
}

impl FailureClassifier<io::Error> {
    /// Classifier for `std::io::Error` based on its `ErrorKind`.
    pub fn io() -> Self {
        Self::new(classify_io_error)
    }
}

/// Map an io error kind to a failure category.
pub fn classify_io_error(error: &io::Error) -> FailureCategory {
    match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureCategory::Timeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => FailureCategory::Connection,
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::NotFound
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::InvalidData
        | io::ErrorKind::AlreadyExists => FailureCategory::Business,
        _ => FailureCategory::Unknown,
    }
}
