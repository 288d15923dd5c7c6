use std::fmt;

use thiserror::Error;
use tonic::{Code, Status};

/// Whether a timed-out operation may have taken effect on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// The operation had no side effects (reads, or nothing was sent).
    NotExecuted,
    /// The backend may or may not have applied the operation.
    Unknown,
}

impl fmt::Display for TimeoutOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutOutcome::NotExecuted => write!(f, "not executed"),
            TimeoutOutcome::Unknown => write!(f, "outcome unknown"),
        }
    }
}

/// Error class used to decide how an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Handled internally by replaying the transaction.
    RetryableTransient,
    ClientMisuse,
    Resource,
    Timeout,
    BackendSemantic,
    Internal,
}

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("transaction aborted: {0}")]
    Aborted(String),
    #[error("invalid statement: {0}")]
    InvalidStatement(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("timed out ({outcome}): {message}")]
    Timeout {
        outcome: TimeoutOutcome,
        message: String,
    },
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error(
        "batch update failed after {} successful statement(s): {source}",
        .update_counts.len()
    )]
    BatchUpdate {
        update_counts: Vec<i64>,
        #[source]
        source: Box<ConnectionError>,
    },
    #[error("backend error: {0}")]
    Backend(Status),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Aborted(_) => ErrorKind::RetryableTransient,
            ConnectionError::InvalidStatement(_)
            | ConnectionError::InvalidArgument(_)
            | ConnectionError::FailedPrecondition(_) => ErrorKind::ClientMisuse,
            ConnectionError::ResourceExhausted(_) => ErrorKind::Resource,
            ConnectionError::Timeout { .. } => ErrorKind::Timeout,
            ConnectionError::OutOfRange(_)
            | ConnectionError::AlreadyExists(_)
            | ConnectionError::Backend(_) => ErrorKind::BackendSemantic,
            ConnectionError::BatchUpdate { source, .. } => source.kind(),
            ConnectionError::Config(_) | ConnectionError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ConnectionError::Aborted(_))
    }

    pub fn timeout(outcome: TimeoutOutcome, message: impl Into<String>) -> Self {
        ConnectionError::Timeout {
            outcome,
            message: message.into(),
        }
    }

    /// Re-labels a timeout with the outcome known at the call site.
    pub fn with_timeout_outcome(self, outcome: TimeoutOutcome) -> Self {
        match self {
            ConnectionError::Timeout { message, .. } => ConnectionError::Timeout { outcome, message },
            other => other,
        }
    }

    /// Update counts of the statements that succeeded before a batch failed.
    pub fn partial_update_counts(&self) -> Option<&[i64]> {
        match self {
            ConnectionError::BatchUpdate { update_counts, .. } => Some(update_counts),
            _ => None,
        }
    }
}

impl From<Status> for ConnectionError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::Aborted => ConnectionError::Aborted(message),
            Code::FailedPrecondition => ConnectionError::FailedPrecondition(message),
            Code::InvalidArgument => ConnectionError::InvalidArgument(message),
            Code::OutOfRange => ConnectionError::OutOfRange(message),
            Code::ResourceExhausted => ConnectionError::ResourceExhausted(message),
            Code::DeadlineExceeded => ConnectionError::Timeout {
                outcome: TimeoutOutcome::Unknown,
                message,
            },
            Code::AlreadyExists => ConnectionError::AlreadyExists(message),
            _ => ConnectionError::Backend(status),
        }
    }
}
