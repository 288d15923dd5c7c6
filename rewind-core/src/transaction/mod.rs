//! Read-write and read-only transactions with transparent abort retry.
//!
//! Every successful operation of a read-write transaction is appended to its
//! [`ReplayLog`] before the caller sees the result. When the backend aborts
//! the transaction, [`Transaction`] begins a new backend transaction and
//! replays the log (see `retry.rs`), then resumes the interrupted operation.

pub mod listener;
pub mod replay;
mod retry;
pub mod savepoint;
pub mod state;

pub use listener::{ReplayOutcome, RetryListener, RetryListeners, RetryResult};
pub use replay::{ReplayEntry, ReplayLog};
pub use savepoint::{Savepoint, SavepointManager};
pub use state::{check_statement, ConnectionState, TransactionFlags};

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::backend::{
    Backend, CommitRequest, CommitResponse, TransactionOptions, TransactionSelector,
};
use crate::batch::interpret_batch_response;
use crate::error::ConnectionError;
use crate::options::{IsolationLevel, RequestOptions};
use crate::session::id::TransactionId;
use crate::session::{OperationKind, SessionHandle, SessionRouter};
use crate::types::{Mutation, ResultSet, Statement};

/// Explicit transactions are opened by the caller; implicit ones wrap a single
/// autocommit statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Explicit,
    Implicit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionSettings {
    pub read_only: bool,
    pub isolation_level: IsolationLevel,
    pub transaction_tag: String,
    pub retry_aborts_internally: bool,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitSettings {
    pub options: RequestOptions,
    pub max_commit_delay: Option<Duration>,
    pub return_commit_stats: bool,
}

/// Collaborators a transaction needs for one call.
#[derive(Clone, Copy)]
pub struct TxContext<'a> {
    pub backend: &'a dyn Backend,
    pub router: &'a SessionRouter,
    pub listeners: &'a RetryListeners,
}

#[derive(Debug, Clone, PartialEq)]
enum TxOperation {
    Query(Statement, RequestOptions),
    Update(Statement, RequestOptions),
    BatchUpdate(Vec<Statement>, RequestOptions),
}

impl TxOperation {
    fn kind(&self) -> OperationKind {
        match self {
            TxOperation::Query(..) => OperationKind::Query,
            TxOperation::Update(..) => OperationKind::Dml,
            TxOperation::BatchUpdate(..) => OperationKind::BatchDml,
        }
    }
}

#[derive(Debug)]
enum TxOutput {
    Rows(ResultSet),
    Count(i64),
    Counts(Vec<i64>),
}

#[derive(Debug)]
pub struct Transaction {
    kind: TransactionKind,
    settings: TransactionSettings,
    session: Option<SessionHandle>,
    backend_id: Option<TransactionId>,
    log: ReplayLog,
    savepoints: SavepointManager,
    retry_count: u32,
    seqno: i64,
    failed: bool,
    in_flight: bool,
    needs_replay: bool,
    original_abort: Option<ConnectionError>,
}

impl Transaction {
    pub fn new(kind: TransactionKind, settings: TransactionSettings) -> Self {
        debug!(
            ?kind,
            read_only = settings.read_only,
            isolation = %settings.isolation_level,
            "transaction started"
        );
        Self {
            kind,
            settings,
            session: None,
            backend_id: None,
            log: ReplayLog::new(),
            savepoints: SavepointManager::new(),
            retry_count: 0,
            seqno: 0,
            failed: false,
            in_flight: false,
            needs_replay: false,
            original_abort: None,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.settings.isolation_level
    }

    pub fn transaction_tag(&self) -> &str {
        &self.settings.transaction_tag
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn log(&self) -> &ReplayLog {
        &self.log
    }

    /// True once an operation failed; only rollback is accepted afterwards.
    pub fn is_failed(&self) -> bool {
        self.failed || self.in_flight
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn has_writes(&self) -> bool {
        self.log.has_writes()
    }

    /// Whether anything ran or was buffered in this transaction.
    pub fn has_work(&self) -> bool {
        !self.log.is_empty() || self.backend_id.is_some()
    }

    pub fn flags(&self) -> TransactionFlags {
        TransactionFlags {
            active: true,
            failed: self.is_failed(),
            has_writes: self.has_writes(),
            read_only: self.is_read_only(),
        }
    }

    pub fn holds_exclusive_session(&self) -> bool {
        self.session.as_ref().is_some_and(SessionHandle::is_exclusive)
    }

    pub async fn query(
        &mut self,
        ctx: TxContext<'_>,
        statement: Statement,
        options: RequestOptions,
    ) -> Result<ResultSet, ConnectionError> {
        match self.run(ctx, TxOperation::Query(statement, options)).await? {
            TxOutput::Rows(rows) => Ok(rows),
            other => Err(unexpected_output(other)),
        }
    }

    pub async fn update(
        &mut self,
        ctx: TxContext<'_>,
        statement: Statement,
        options: RequestOptions,
    ) -> Result<i64, ConnectionError> {
        match self.run(ctx, TxOperation::Update(statement, options)).await? {
            TxOutput::Count(count) => Ok(count),
            other => Err(unexpected_output(other)),
        }
    }

    pub async fn batch_update(
        &mut self,
        ctx: TxContext<'_>,
        statements: Vec<Statement>,
        options: RequestOptions,
    ) -> Result<Vec<i64>, ConnectionError> {
        if statements.is_empty() {
            return Ok(Vec::new());
        }
        match self
            .run(ctx, TxOperation::BatchUpdate(statements, options))
            .await?
        {
            TxOutput::Counts(counts) => Ok(counts),
            other => Err(unexpected_output(other)),
        }
    }

    /// Buffers mutations to be sent with the commit.
    pub fn buffer_mutations(&mut self, mutations: Vec<Mutation>) -> Result<(), ConnectionError> {
        self.ensure_usable()?;
        if self.is_read_only() {
            return Err(ConnectionError::FailedPrecondition(
                "mutations are not allowed in a read-only transaction".to_string(),
            ));
        }
        if !mutations.is_empty() {
            self.log.push(ReplayEntry::Mutations(mutations));
        }
        Ok(())
    }

    /// Commits the transaction. Returns `None` when nothing had to be sent to
    /// the backend (read-only or empty transactions).
    #[instrument(skip_all, fields(kind = ?self.kind, entries = self.log.len()))]
    pub async fn commit(
        &mut self,
        ctx: TxContext<'_>,
        settings: CommitSettings,
    ) -> Result<Option<CommitResponse>, ConnectionError> {
        self.ensure_usable()?;
        if self.is_read_only() || self.log.is_empty() {
            debug!("nothing to commit");
            self.rollback_backend(ctx).await;
            self.finish();
            return Ok(None);
        }

        let session = match self.session.take() {
            Some(session) => session,
            None => self.acquire_session(ctx, OperationKind::Mutation).await?,
        };
        self.in_flight = true;
        let result = self.commit_with_retry(ctx, &session, &settings).await;
        self.in_flight = false;

        match result {
            Ok(response) => {
                info!(
                    retries = self.retry_count,
                    commit_timestamp = %response.commit_timestamp,
                    "transaction committed"
                );
                self.session = Some(session);
                self.finish();
                Ok(Some(response))
            }
            Err(err) => {
                warn!(error = %err, "commit failed");
                self.session = Some(session);
                self.failed = true;
                Err(err)
            }
        }
    }

    /// Rolls back the backend transaction if one was started and releases
    /// the session. Never fails: a rollback error only means the backend will
    /// expire the transaction itself.
    #[instrument(skip_all, fields(kind = ?self.kind, entries = self.log.len()))]
    pub async fn rollback(&mut self, ctx: TxContext<'_>) {
        self.rollback_backend(ctx).await;
        info!("transaction rolled back");
        self.finish();
    }

    pub fn set_savepoint(&mut self, name: Option<&str>) -> Result<Savepoint, ConnectionError> {
        self.ensure_usable()?;
        let savepoint = self.savepoints.set(name, self.log.len())?;
        debug!(%savepoint, log_index = self.log.len(), "savepoint set");
        Ok(savepoint)
    }

    pub fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), ConnectionError> {
        self.ensure_usable()?;
        self.savepoints.release(savepoint)
    }

    /// Truncates the replay log to the savepoint. Writes already sent to the
    /// backend cannot be undone there, so when any are cut off the backend
    /// transaction is discarded and the remaining log is replayed on the next
    /// operation.
    pub async fn rollback_to_savepoint(
        &mut self,
        ctx: TxContext<'_>,
        savepoint: &Savepoint,
    ) -> Result<(), ConnectionError> {
        self.ensure_usable()?;
        let log_index = self.savepoints.rollback_to(savepoint)?;
        let removed = self.log.truncate(log_index);
        let discarded_writes = removed.iter().any(ReplayEntry::is_issued_write);
        debug!(
            %savepoint,
            removed = removed.len(),
            discarded_writes,
            "rolled back to savepoint"
        );
        if discarded_writes {
            self.rollback_backend(ctx).await;
            self.needs_replay = !self.log.is_empty();
        }
        Ok(())
    }

    fn ensure_usable(&mut self) -> Result<(), ConnectionError> {
        if self.in_flight {
            self.in_flight = false;
            self.failed = true;
            warn!("previous statement was cancelled, transaction must be rolled back");
        }
        if self.failed {
            return Err(ConnectionError::FailedPrecondition(
                "the current transaction has failed and must be rolled back".to_string(),
            ));
        }
        Ok(())
    }

    fn retries_enabled(&self) -> bool {
        !self.is_read_only() && self.settings.retry_aborts_internally
    }

    /// Runs one operation. The session is moved out for the duration of the
    /// call, so a cancelled call releases it.
    async fn run(
        &mut self,
        ctx: TxContext<'_>,
        operation: TxOperation,
    ) -> Result<TxOutput, ConnectionError> {
        self.ensure_usable()?;
        let session = match self.session.take() {
            Some(session) => session,
            None => self.acquire_session(ctx, operation.kind()).await?,
        };

        self.in_flight = true;
        let result = self.run_with_retry(ctx, &session, &operation).await;
        self.in_flight = false;
        self.session = Some(session);

        match result {
            Ok(output) => {
                if !self.is_read_only() {
                    self.record(operation, &output);
                }
                Ok(output)
            }
            Err(err) => {
                if err.is_aborted() {
                    warn!(error = %err, "transaction aborted and not retried");
                }
                self.failed = true;
                Err(err)
            }
        }
    }

    async fn run_with_retry(
        &mut self,
        ctx: TxContext<'_>,
        session: &SessionHandle,
        operation: &TxOperation,
    ) -> Result<TxOutput, ConnectionError> {
        loop {
            self.ensure_replayed(ctx, session).await?;
            match self.execute_once(ctx, session, operation).await {
                Err(err) if err.is_aborted() && self.retries_enabled() => {
                    self.retry(ctx, session, err).await?;
                }
                other => return other,
            }
        }
    }

    async fn commit_with_retry(
        &mut self,
        ctx: TxContext<'_>,
        session: &SessionHandle,
        settings: &CommitSettings,
    ) -> Result<CommitResponse, ConnectionError> {
        loop {
            self.ensure_replayed(ctx, session).await?;
            match self.commit_once(ctx, session, settings).await {
                Err(err) if err.is_aborted() && self.retries_enabled() => {
                    self.retry(ctx, session, err).await?;
                }
                other => return other,
            }
        }
    }

    async fn execute_once(
        &mut self,
        ctx: TxContext<'_>,
        session: &SessionHandle,
        operation: &TxOperation,
    ) -> Result<TxOutput, ConnectionError> {
        let id = self.ensure_begun(ctx, session).await?;
        let backend_session = session.session();
        match operation {
            TxOperation::Query(statement, options) => ctx
                .backend
                .execute_query(
                    backend_session,
                    &TransactionSelector::Id(id),
                    statement,
                    options,
                )
                .await
                .map(TxOutput::Rows)
                .map_err(ConnectionError::from),
            TxOperation::Update(statement, options) => {
                self.seqno += 1;
                ctx.backend
                    .execute_dml(backend_session, &id, statement, self.seqno, options)
                    .await
                    .map(TxOutput::Count)
                    .map_err(ConnectionError::from)
            }
            TxOperation::BatchUpdate(statements, options) => {
                self.seqno += 1;
                let response = ctx
                    .backend
                    .execute_batch_dml(backend_session, &id, statements, self.seqno, options)
                    .await?;
                interpret_batch_response(response).map(TxOutput::Counts)
            }
        }
    }

    async fn commit_once(
        &mut self,
        ctx: TxContext<'_>,
        session: &SessionHandle,
        settings: &CommitSettings,
    ) -> Result<CommitResponse, ConnectionError> {
        let id = self.ensure_begun(ctx, session).await?;
        let request = CommitRequest {
            mutations: self.log.mutations(),
            max_commit_delay: settings.max_commit_delay,
            return_commit_stats: settings.return_commit_stats,
            options: settings.options.clone(),
        };
        ctx.backend
            .commit(session.session(), &id, &request)
            .await
            .map_err(ConnectionError::from)
    }

    async fn ensure_begun(
        &mut self,
        ctx: TxContext<'_>,
        session: &SessionHandle,
    ) -> Result<TransactionId, ConnectionError> {
        if let Some(id) = &self.backend_id {
            return Ok(id.clone());
        }
        let options = TransactionOptions {
            read_only: self.settings.read_only,
            isolation_level: self.settings.isolation_level,
            transaction_tag: self.settings.transaction_tag.clone(),
        };
        let id = ctx
            .backend
            .begin_transaction(session.session(), &options)
            .await?;
        debug!(transaction_id = %id, session = %session.session().name(), "began backend transaction");
        self.backend_id = Some(id.clone());
        Ok(id)
    }

    async fn acquire_session(
        &self,
        ctx: TxContext<'_>,
        kind: OperationKind,
    ) -> Result<SessionHandle, ConnectionError> {
        ctx.router.acquire(kind, !self.is_read_only()).await
    }

    fn record(&mut self, operation: TxOperation, output: &TxOutput) {
        let entry = match (operation, output) {
            (TxOperation::Query(statement, options), TxOutput::Rows(rows)) => {
                ReplayEntry::query(statement, &options, rows)
            }
            (TxOperation::Update(statement, options), TxOutput::Count(count)) => {
                ReplayEntry::update(statement, &options, *count)
            }
            (TxOperation::BatchUpdate(statements, options), TxOutput::Counts(counts)) => {
                ReplayEntry::batch_update(statements, &options, counts.clone())
            }
            _ => return,
        };
        self.log.push(entry);
    }

    async fn rollback_backend(&mut self, ctx: TxContext<'_>) {
        match self.session.take() {
            Some(session) => {
                self.discard_backend_transaction(ctx, &session).await;
                self.session = Some(session);
            }
            None => {
                self.backend_id = None;
                self.seqno = 0;
            }
        }
    }

    /// Rolls back the current backend transaction, if any, on `session`.
    /// The next operation begins a new one with sequence numbers from 1.
    pub(super) async fn discard_backend_transaction(
        &mut self,
        ctx: TxContext<'_>,
        session: &SessionHandle,
    ) {
        self.seqno = 0;
        let Some(id) = self.backend_id.take() else {
            return;
        };
        if self.is_read_only() {
            return;
        }
        if let Err(status) = ctx.backend.rollback(session.session(), &id).await {
            warn!(transaction_id = %id, error = %status, "backend rollback failed");
        }
    }

    fn finish(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.release();
        }
        self.backend_id = None;
        self.log.clear();
        self.savepoints = SavepointManager::new();
        self.needs_replay = false;
    }
}

fn unexpected_output(output: TxOutput) -> ConnectionError {
    ConnectionError::Internal(format!("unexpected operation output: {output:?}"))
}
