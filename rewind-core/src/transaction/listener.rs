//! Hooks observing transparent transaction retries.

use std::fmt;
use std::sync::Arc;

use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryResult {
    Successful,
    /// The replay was aborted again and another attempt follows.
    AbortedAndRestarting,
    /// The retry budget is spent; the original abort is surfaced.
    AbortedAndMaxAttemptsExceeded,
    /// A replayed entry failed with a non-retryable error.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Unchanged,
    /// The replayed entry observed different rows or update counts than the
    /// original execution.
    ResultChanged,
}

/// Callbacks invoked while an aborted transaction is replayed. All methods
/// have empty defaults.
pub trait RetryListener: Send + Sync {
    fn retry_starting(&self, _attempt: u32) {}

    fn entry_replaying(&self, _attempt: u32, _index: usize, _description: &str) {}

    fn entry_replayed(&self, _attempt: u32, _index: usize, _outcome: ReplayOutcome) {}

    fn entry_failed(&self, _attempt: u32, _index: usize, _error: &ConnectionError) {}

    fn retry_finished(&self, _attempt: u32, _result: RetryResult) {}
}

/// Listeners in registration order.
#[derive(Clone, Default)]
pub struct RetryListeners {
    listeners: Vec<Arc<dyn RetryListener>>,
}

impl RetryListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn RetryListener>) {
        self.listeners.push(listener);
    }

    /// Removes a listener previously added. Returns false if it was not
    /// registered.
    pub fn remove(&mut self, listener: &Arc<dyn RetryListener>) -> bool {
        let before = self.listeners.len();
        self.listeners
            .retain(|registered| !Arc::ptr_eq(registered, listener));
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn notify(&self, f: impl Fn(&dyn RetryListener)) {
        for listener in &self.listeners {
            f(listener.as_ref());
        }
    }
}

impl fmt::Debug for RetryListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryListeners")
            .field("len", &self.listeners.len())
            .finish()
    }
}
