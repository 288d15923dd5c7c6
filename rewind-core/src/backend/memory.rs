//! In-process [`Backend`] used by tests and the shell.
//!
//! Writes are buffered per transaction and only appear in
//! [`InMemoryBackend::committed_writes`] once a commit succeeds, so a test can
//! compare the final state of a retried transaction with an uninterrupted one.
//! Every call is recorded and faults can be injected at any time.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tonic::Status;
use tracing::debug;

use super::{
    Backend, BackendSession, BatchDmlResponse, CommitRequest, CommitResponse, CommitStats,
    DdlOperation, TransactionOptions, TransactionSelector,
};
use crate::options::{IsolationLevel, RequestOptions};
use crate::session::id::TransactionId;
use crate::types::{Mutation, ResultSet, Statement};

/// Backend RPCs, as recorded by [`InMemoryBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rpc {
    CreateSession,
    DeleteSession,
    BeginTransaction,
    ExecuteQuery,
    ExecuteDml,
    ExecuteBatchDml,
    Commit,
    Rollback,
    UpdateDdl,
    GetOperation,
}

#[derive(Debug, Clone)]
pub enum Fault {
    /// Abort the commit with this 1-based attempt number, once.
    AbortCommit { attempt: usize },
    /// Abort every commit.
    AbortAllCommits,
    /// Abort the next `times` statements whose SQL contains the pattern.
    AbortStatement { sql_contains: String, times: usize },
    /// Fail every statement whose SQL contains the pattern.
    FailStatement { sql_contains: String, status: Status },
    /// Fail the next schema operation once it completes.
    FailDdl(Status),
}

/// A write that became visible through a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedWrite {
    Dml(Statement),
    Mutation(Mutation),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub rpc: Rpc,
    pub session: Option<String>,
    pub sql: Vec<String>,
    pub seqno: Option<i64>,
    pub options: RequestOptions,
    pub isolation_level: Option<IsolationLevel>,
    pub max_commit_delay: Option<Duration>,
}

impl RecordedRequest {
    fn new(rpc: Rpc, session: Option<&BackendSession>) -> Self {
        Self {
            rpc,
            session: session.map(|s| s.name().to_string()),
            sql: Vec::new(),
            seqno: None,
            options: RequestOptions::default(),
            isolation_level: None,
            max_commit_delay: None,
        }
    }
}

#[derive(Debug, Default)]
struct TransactionState {
    read_only: bool,
    aborted: bool,
    pending: Vec<AppliedWrite>,
}

#[derive(Debug)]
struct PendingOperation {
    remaining_polls: usize,
    statements: Vec<String>,
    error: Option<Status>,
}

#[derive(Debug)]
struct State {
    multiplexed_supported: bool,
    latency: Duration,
    ddl_polls: usize,
    next_id: u64,
    sessions: HashSet<String>,
    transactions: HashMap<TransactionId, TransactionState>,
    operations: HashMap<String, PendingOperation>,
    query_results: Vec<(String, ResultSet)>,
    update_counts: Vec<(String, i64)>,
    faults: Vec<Fault>,
    commit_attempts: usize,
    committed: Vec<AppliedWrite>,
    applied_ddl: Vec<String>,
    requests: Vec<RecordedRequest>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            multiplexed_supported: true,
            latency: Duration::ZERO,
            ddl_polls: 0,
            next_id: 1,
            sessions: HashSet::new(),
            transactions: HashMap::new(),
            operations: HashMap::new(),
            query_results: Vec::new(),
            update_counts: Vec::new(),
            faults: Vec::new(),
            commit_attempts: 0,
            committed: Vec::new(),
            applied_ddl: Vec::new(),
            requests: Vec::new(),
        }
    }
}

impl State {
    fn next_name(&mut self, prefix: &str) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("{prefix}/{id}")
    }

    fn check_session(&self, session: &BackendSession) -> Result<(), Status> {
        if self.sessions.contains(session.name()) {
            Ok(())
        } else {
            Err(Status::not_found(format!(
                "session not found: {}",
                session.name()
            )))
        }
    }

    fn transaction(&mut self, id: &TransactionId) -> Result<&mut TransactionState, Status> {
        let txn = self.transactions.get_mut(id).ok_or_else(|| {
            Status::failed_precondition(format!("transaction not found: {id}"))
        })?;
        if txn.aborted {
            return Err(Status::aborted(format!("transaction {id} was aborted")));
        }
        Ok(txn)
    }

    fn abort_transaction(&mut self, id: &TransactionId) {
        if let Some(txn) = self.transactions.get_mut(id) {
            txn.aborted = true;
            txn.pending.clear();
        }
    }

    /// Applies statement faults. Aborts take precedence over failures.
    fn statement_fault(&mut self, sql: &str) -> Option<Status> {
        for fault in self.faults.iter_mut() {
            if let Fault::AbortStatement {
                sql_contains,
                times,
            } = fault
            {
                if *times > 0 && sql.contains(sql_contains.as_str()) {
                    *times -= 1;
                    return Some(Status::aborted(format!("statement aborted: {sql}")));
                }
            }
        }
        self.faults.iter().find_map(|fault| match fault {
            Fault::FailStatement {
                sql_contains,
                status,
            } if sql.contains(sql_contains.as_str()) => Some(status.clone()),
            _ => None,
        })
    }

    fn commit_fault(&mut self) -> bool {
        let attempt = self.commit_attempts;
        let position = self.faults.iter().position(|fault| match fault {
            Fault::AbortCommit { attempt: nth } => *nth == attempt,
            Fault::AbortAllCommits => true,
            _ => false,
        });
        match position {
            Some(index) => {
                if matches!(self.faults[index], Fault::AbortCommit { .. }) {
                    self.faults.remove(index);
                }
                true
            }
            None => false,
        }
    }

    fn update_count(&self, sql: &str) -> i64 {
        self.update_counts
            .iter()
            .rev()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map_or(1, |(_, count)| *count)
    }

    fn query_result(&self, sql: &str) -> ResultSet {
        self.query_results
            .iter()
            .rev()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject multiplexed session creation, forcing reads onto pooled sessions.
    pub fn without_multiplexed_sessions(self) -> Self {
        self.state().multiplexed_supported = false;
        self
    }

    /// Number of `get_operation` polls before a schema operation completes.
    pub fn with_ddl_polls(self, polls: usize) -> Self {
        self.state().ddl_polls = polls;
        self
    }

    /// Delay applied to every call before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn inject(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Rows returned by queries whose SQL contains `sql_contains`. Later
    /// registrations win.
    pub fn set_query_result(&self, sql_contains: impl Into<String>, result: ResultSet) {
        self.state()
            .query_results
            .push((sql_contains.into(), result));
    }

    /// Update count reported for DML whose SQL contains `sql_contains`
    /// (defaults to 1).
    pub fn set_update_count(&self, sql_contains: impl Into<String>, count: i64) {
        self.state().update_counts.push((sql_contains.into(), count));
    }

    pub fn committed_writes(&self) -> Vec<AppliedWrite> {
        self.state().committed.clone()
    }

    pub fn applied_ddl(&self) -> Vec<String> {
        self.state().applied_ddl.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn requests_for(&self, rpc: Rpc) -> Vec<RecordedRequest> {
        self.state()
            .requests
            .iter()
            .filter(|request| request.rpc == rpc)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, rpc: Rpc) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|request| request.rpc == rpc)
            .count()
    }

    pub fn live_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn create_session(&self, multiplexed: bool) -> Result<BackendSession, Status> {
        self.delay().await;
        let mut state = self.state();
        state
            .requests
            .push(RecordedRequest::new(Rpc::CreateSession, None));
        if multiplexed && !state.multiplexed_supported {
            return Err(Status::unimplemented("multiplexed sessions are not supported"));
        }
        let name = state.next_name("sessions");
        state.sessions.insert(name.clone());
        debug!(session = %name, multiplexed, "created session");
        Ok(BackendSession::new(name, multiplexed))
    }

    async fn delete_session(&self, session: &BackendSession) -> Result<(), Status> {
        self.delay().await;
        let mut state = self.state();
        state
            .requests
            .push(RecordedRequest::new(Rpc::DeleteSession, Some(session)));
        if state.sessions.remove(session.name()) {
            Ok(())
        } else {
            Err(Status::not_found(format!(
                "session not found: {}",
                session.name()
            )))
        }
    }

    async fn begin_transaction(
        &self,
        session: &BackendSession,
        options: &TransactionOptions,
    ) -> Result<TransactionId, Status> {
        self.delay().await;
        let mut state = self.state();
        let mut request = RecordedRequest::new(Rpc::BeginTransaction, Some(session));
        request.options.transaction_tag = options.transaction_tag.clone();
        request.isolation_level = Some(options.isolation_level);
        state.requests.push(request);
        state.check_session(session)?;
        let id = TransactionId::new();
        state.transactions.insert(
            id.clone(),
            TransactionState {
                read_only: options.read_only,
                ..TransactionState::default()
            },
        );
        Ok(id)
    }

    async fn execute_query(
        &self,
        session: &BackendSession,
        selector: &TransactionSelector,
        statement: &Statement,
        options: &RequestOptions,
    ) -> Result<ResultSet, Status> {
        self.delay().await;
        let mut state = self.state();
        let mut request = RecordedRequest::new(Rpc::ExecuteQuery, Some(session));
        request.sql.push(statement.sql.clone());
        request.options = options.clone();
        state.requests.push(request);
        state.check_session(session)?;
        if let TransactionSelector::Id(id) = selector {
            state.transaction(id)?;
        }
        if let Some(status) = state.statement_fault(&statement.sql) {
            if let (TransactionSelector::Id(id), tonic::Code::Aborted) = (selector, status.code())
            {
                state.abort_transaction(id);
            }
            return Err(status);
        }
        Ok(state.query_result(&statement.sql))
    }

    async fn execute_dml(
        &self,
        session: &BackendSession,
        transaction: &TransactionId,
        statement: &Statement,
        seqno: i64,
        options: &RequestOptions,
    ) -> Result<i64, Status> {
        self.delay().await;
        let mut state = self.state();
        let mut request = RecordedRequest::new(Rpc::ExecuteDml, Some(session));
        request.sql.push(statement.sql.clone());
        request.seqno = Some(seqno);
        request.options = options.clone();
        state.requests.push(request);
        state.check_session(session)?;
        if state.transaction(transaction)?.read_only {
            return Err(Status::failed_precondition(
                "DML is not allowed in a read-only transaction",
            ));
        }
        if let Some(status) = state.statement_fault(&statement.sql) {
            if status.code() == tonic::Code::Aborted {
                state.abort_transaction(transaction);
            }
            return Err(status);
        }
        let count = state.update_count(&statement.sql);
        state
            .transaction(transaction)?
            .pending
            .push(AppliedWrite::Dml(statement.clone()));
        Ok(count)
    }

    async fn execute_batch_dml(
        &self,
        session: &BackendSession,
        transaction: &TransactionId,
        statements: &[Statement],
        seqno: i64,
        options: &RequestOptions,
    ) -> Result<BatchDmlResponse, Status> {
        self.delay().await;
        let mut state = self.state();
        let mut request = RecordedRequest::new(Rpc::ExecuteBatchDml, Some(session));
        request.sql = statements.iter().map(|s| s.sql.clone()).collect();
        request.seqno = Some(seqno);
        request.options = options.clone();
        state.requests.push(request);
        state.check_session(session)?;
        if state.transaction(transaction)?.read_only {
            return Err(Status::failed_precondition(
                "DML is not allowed in a read-only transaction",
            ));
        }

        let mut response = BatchDmlResponse::default();
        let mut applied = Vec::with_capacity(statements.len());
        for statement in statements {
            if let Some(status) = state.statement_fault(&statement.sql) {
                if status.code() == tonic::Code::Aborted {
                    state.abort_transaction(transaction);
                    return Err(status);
                }
                response.status = Some(status);
                break;
            }
            response.update_counts.push(state.update_count(&statement.sql));
            applied.push(AppliedWrite::Dml(statement.clone()));
        }
        state.transaction(transaction)?.pending.extend(applied);
        Ok(response)
    }

    async fn commit(
        &self,
        session: &BackendSession,
        transaction: &TransactionId,
        request: &CommitRequest,
    ) -> Result<CommitResponse, Status> {
        self.delay().await;
        let mut state = self.state();
        let mut recorded = RecordedRequest::new(Rpc::Commit, Some(session));
        recorded.options = request.options.clone();
        recorded.max_commit_delay = request.max_commit_delay;
        state.requests.push(recorded);
        state.check_session(session)?;
        state.transaction(transaction)?;
        state.commit_attempts += 1;
        if state.commit_fault() {
            state.abort_transaction(transaction);
            return Err(Status::aborted(format!(
                "commit of transaction {transaction} aborted"
            )));
        }

        let mut txn = state.transactions.remove(transaction).unwrap_or_default();
        txn.pending
            .extend(request.mutations.iter().cloned().map(AppliedWrite::Mutation));
        let mutation_count = txn
            .pending
            .iter()
            .map(|write| match write {
                AppliedWrite::Dml(_) => 1,
                AppliedWrite::Mutation(m) => m.rows.len().max(1) as i64,
            })
            .sum();
        state.committed.extend(txn.pending);
        Ok(CommitResponse {
            commit_timestamp: Utc::now(),
            commit_stats: request
                .return_commit_stats
                .then_some(CommitStats { mutation_count }),
        })
    }

    async fn rollback(
        &self,
        session: &BackendSession,
        transaction: &TransactionId,
    ) -> Result<(), Status> {
        self.delay().await;
        let mut state = self.state();
        state
            .requests
            .push(RecordedRequest::new(Rpc::Rollback, Some(session)));
        state.check_session(session)?;
        state.transactions.remove(transaction);
        Ok(())
    }

    async fn update_ddl(&self, statements: &[String]) -> Result<DdlOperation, Status> {
        self.delay().await;
        let mut state = self.state();
        let mut request = RecordedRequest::new(Rpc::UpdateDdl, None);
        request.sql = statements.to_vec();
        state.requests.push(request);

        let mut error = None;
        if let Some(index) = state
            .faults
            .iter()
            .position(|fault| matches!(fault, Fault::FailDdl(_)))
        {
            if let Fault::FailDdl(status) = state.faults.remove(index) {
                error = Some(status);
            }
        }
        let name = state.next_name("operations");
        let pending = PendingOperation {
            remaining_polls: state.ddl_polls,
            statements: statements.to_vec(),
            error,
        };
        if pending.remaining_polls == 0 {
            return Ok(finish_operation(&mut state, name, pending));
        }
        state.operations.insert(name.clone(), pending);
        Ok(DdlOperation {
            name,
            done: false,
            error: None,
        })
    }

    async fn get_operation(&self, name: &str) -> Result<DdlOperation, Status> {
        self.delay().await;
        let mut state = self.state();
        let mut request = RecordedRequest::new(Rpc::GetOperation, None);
        request.sql.push(name.to_string());
        state.requests.push(request);

        let mut pending = state
            .operations
            .remove(name)
            .ok_or_else(|| Status::not_found(format!("operation not found: {name}")))?;
        pending.remaining_polls = pending.remaining_polls.saturating_sub(1);
        if pending.remaining_polls == 0 {
            return Ok(finish_operation(&mut state, name.to_string(), pending));
        }
        state.operations.insert(name.to_string(), pending);
        Ok(DdlOperation {
            name: name.to_string(),
            done: false,
            error: None,
        })
    }
}

fn finish_operation(state: &mut State, name: String, pending: PendingOperation) -> DdlOperation {
    if pending.error.is_none() {
        state.applied_ddl.extend(pending.statements);
    }
    DdlOperation {
        name,
        done: true,
        error: pending.error,
    }
}
