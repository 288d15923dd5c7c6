//! Boundary to the database service.
//!
//! The wire client is a black box behind [`Backend`]; every call may fail
//! with a [`tonic::Status`] whose code drives error classification
//! (`Aborted` transactions are replayed, everything else is surfaced).
//! [`InMemoryBackend`] implements the trait for tests and the shell.

pub mod memory;

pub use memory::{AppliedWrite, Fault, InMemoryBackend, RecordedRequest, Rpc};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tonic::Status;

use crate::options::{IsolationLevel, RequestOptions};
use crate::session::id::TransactionId;
use crate::types::{Mutation, ResultSet, Statement};

/// A backend session. Multiplexed sessions may be shared by many connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendSession {
    name: String,
    multiplexed: bool,
}

impl BackendSession {
    pub fn new(name: impl Into<String>, multiplexed: bool) -> Self {
        Self {
            name: name.into(),
            multiplexed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }
}

/// How a read selects its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionSelector {
    /// A one-shot read-only snapshot read.
    SingleUseReadOnly,
    /// A transaction begun with `begin_transaction`.
    Id(TransactionId),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOptions {
    pub read_only: bool,
    pub isolation_level: IsolationLevel,
    pub transaction_tag: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitRequest {
    pub mutations: Vec<Mutation>,
    pub max_commit_delay: Option<Duration>,
    pub return_commit_stats: bool,
    pub options: RequestOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    pub mutation_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitResponse {
    pub commit_timestamp: DateTime<Utc>,
    pub commit_stats: Option<CommitStats>,
}

/// Result of an `ExecuteBatchDml` call. Statements run in order and stop at
/// the first failure: `update_counts` covers the successful prefix and
/// `status` carries the failure, if any.
#[derive(Debug, Clone, Default)]
pub struct BatchDmlResponse {
    pub update_counts: Vec<i64>,
    pub status: Option<Status>,
}

/// Long-running schema change operation.
#[derive(Debug, Clone)]
pub struct DdlOperation {
    pub name: String,
    pub done: bool,
    pub error: Option<Status>,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn create_session(&self, multiplexed: bool) -> Result<BackendSession, Status>;

    async fn delete_session(&self, session: &BackendSession) -> Result<(), Status>;

    async fn begin_transaction(
        &self,
        session: &BackendSession,
        options: &TransactionOptions,
    ) -> Result<TransactionId, Status>;

    async fn execute_query(
        &self,
        session: &BackendSession,
        selector: &TransactionSelector,
        statement: &Statement,
        options: &RequestOptions,
    ) -> Result<ResultSet, Status>;

    async fn execute_dml(
        &self,
        session: &BackendSession,
        transaction: &TransactionId,
        statement: &Statement,
        seqno: i64,
        options: &RequestOptions,
    ) -> Result<i64, Status>;

    async fn execute_batch_dml(
        &self,
        session: &BackendSession,
        transaction: &TransactionId,
        statements: &[Statement],
        seqno: i64,
        options: &RequestOptions,
    ) -> Result<BatchDmlResponse, Status>;

    async fn commit(
        &self,
        session: &BackendSession,
        transaction: &TransactionId,
        request: &CommitRequest,
    ) -> Result<CommitResponse, Status>;

    async fn rollback(
        &self,
        session: &BackendSession,
        transaction: &TransactionId,
    ) -> Result<(), Status>;

    /// Submit schema statements as one admin operation.
    async fn update_ddl(&self, statements: &[String]) -> Result<DdlOperation, Status>;

    /// Poll a schema operation started by [`Backend::update_ddl`].
    async fn get_operation(&self, name: &str) -> Result<DdlOperation, Status>;
}
