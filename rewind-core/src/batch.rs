//! Batched DML and DDL buffers.
//!
//! A DML batch is sent to the backend as one `ExecuteBatchDml` request. The
//! backend stops at the first failing statement; the counts of the
//! statements that ran before it travel with the resulting
//! [`ConnectionError::BatchUpdate`].

use std::mem;

use crate::backend::BatchDmlResponse;
use crate::error::ConnectionError;
use crate::types::Statement;

#[derive(Debug, Clone, Default)]
pub struct DmlBatch {
    statements: Vec<Statement>,
}

impl DmlBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Empties the buffer, returning what it held.
    pub fn take(&mut self) -> Vec<Statement> {
        mem::take(&mut self.statements)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DdlBatch {
    statements: Vec<String>,
}

impl DdlBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sql: impl Into<String>) {
        self.statements.push(sql.into());
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn take(&mut self) -> Vec<String> {
        mem::take(&mut self.statements)
    }
}

/// Turns a batch response into update counts or a batch-update error.
/// Aborts are passed through unwrapped so the transaction can be retried.
pub fn interpret_batch_response(response: BatchDmlResponse) -> Result<Vec<i64>, ConnectionError> {
    match response.status {
        None => Ok(response.update_counts),
        Some(status) => {
            let cause = ConnectionError::from(status);
            if cause.is_aborted() {
                return Err(cause);
            }
            Err(ConnectionError::BatchUpdate {
                update_counts: response.update_counts,
                source: Box::new(cause),
            })
        }
    }
}

pub fn narrow_update_count(count: i64) -> Result<i32, ConnectionError> {
    i32::try_from(count).map_err(|_| {
        ConnectionError::OutOfRange(format!(
            "update count {count} does not fit in a 32-bit integer, use the large variant"
        ))
    })
}

pub fn narrow_update_counts(counts: &[i64]) -> Result<Vec<i32>, ConnectionError> {
    counts.iter().copied().map(narrow_update_count).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Status;

    #[test]
    fn take_empties_the_buffer() {
        let mut batch = DmlBatch::new();
        batch.add(Statement::new("UPDATE a SET v = 1"));
        batch.add(Statement::new("UPDATE b SET v = 1"));
        assert_eq!(batch.len(), 2);
        let taken = batch.take();
        assert_eq!(taken.len(), 2);
        assert!(batch.is_empty());
    }

    #[test]
    fn partial_failure_carries_successful_counts() {
        let response = BatchDmlResponse {
            update_counts: vec![4, 2],
            status: Some(Status::already_exists("duplicate")),
        };
        let err = interpret_batch_response(response).expect_err("batch failed");
        assert_eq!(err.partial_update_counts(), Some(&[4, 2][..]));
        match err {
            ConnectionError::BatchUpdate { source, .. } => {
                assert!(matches!(*source, ConnectionError::AlreadyExists(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn aborted_batch_is_not_wrapped() {
        let response = BatchDmlResponse {
            update_counts: vec![1],
            status: Some(Status::aborted("contention")),
        };
        let err = interpret_batch_response(response).expect_err("aborted");
        assert!(err.is_aborted());
    }

    #[test]
    fn narrow_counts_reject_overflow() -> anyhow::Result<()> {
        assert_eq!(narrow_update_counts(&[1, 2])?, vec![1, 2]);
        let large = i64::from(i32::MAX) + 1;
        assert!(matches!(
            narrow_update_counts(&[1, large]),
            Err(ConnectionError::OutOfRange(_))
        ));
        assert_eq!(narrow_update_count(-1)?, -1);
        Ok(())
    }
}
