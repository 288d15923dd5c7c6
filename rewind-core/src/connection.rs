//! The connection facade used by SQL front-ends.
//!
//! A [`Runtime`] owns the backend, the session pool and the configuration
//! shared by all connections. Each [`Connection`] is single-threaded: it is
//! driven through `&mut self` and owns at most one open transaction.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, CommitResponse, TransactionSelector};
use crate::batch::{narrow_update_count, narrow_update_counts, DdlBatch, DmlBatch};
use crate::config::RuntimeConfig;
use crate::ddl::{run_ddl, DdlConfig};
use crate::error::{ConnectionError, TimeoutOutcome};
use crate::options::{resolve, EffectiveOptions, IsolationLevel, OptionLayer, RequestOptions};
use crate::session::id::{next_connection_id, ConnectionId};
use crate::session::{OperationKind, PoolSnapshot, SessionHandle, SessionPool, SessionRouter};
use crate::sql::command::{format_duration, parse_bool, parse_duration};
use crate::sql::{BatchControl, ClientCommand, ParsedStatement, StatementKind, Variable};
use crate::transaction::{
    check_statement, CommitSettings, ConnectionState, RetryListener, RetryListeners, Savepoint,
    Transaction, TransactionFlags, TransactionKind, TransactionSettings, TxContext,
};
use crate::types::{Mutation, ResultSet, Statement, Value};

/// Backend, session pool and configuration shared by connections.
#[derive(Clone)]
pub struct Runtime {
    backend: Arc<dyn Backend>,
    router: SessionRouter,
    config: Arc<RuntimeConfig>,
}

impl Runtime {
    pub async fn connect(
        backend: Arc<dyn Backend>,
        config: RuntimeConfig,
    ) -> Result<Self, ConnectionError> {
        config.validate()?;
        let pool = SessionPool::connect(backend.clone(), config.pool.clone()).await?;
        Ok(Self {
            backend,
            router: SessionRouter::new(pool),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Opens a connection. The environment defaults are captured now; later
    /// configuration changes do not affect it.
    pub fn connection(&self) -> Connection {
        Connection::new(self)
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.router.pool().snapshot()
    }

    pub async fn evict_idle_sessions(&self) -> usize {
        self.router.pool().evict_idle().await
    }

    pub async fn close(&self) {
        self.router.pool().close().await;
    }
}

/// Per-statement execution options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOptions {
    /// Overrides the connection's statement timeout.
    pub timeout: Option<Duration>,
    /// Request options for this statement only. They take precedence over
    /// hints embedded in the SQL text.
    pub overrides: OptionLayer,
}

impl StatementOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn with_overrides(overrides: OptionLayer) -> Self {
        Self {
            timeout: None,
            overrides,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementResult {
    ResultSet(ResultSet),
    UpdateCount(i64),
    UpdateCounts(Vec<i64>),
    NoResult,
}

impl StatementResult {
    pub fn into_result_set(self) -> Option<ResultSet> {
        match self {
            StatementResult::ResultSet(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn update_count(&self) -> Option<i64> {
        match self {
            StatementResult::UpdateCount(count) => Some(*count),
            _ => None,
        }
    }
}

struct ActiveDdlBatch {
    batch: DdlBatch,
    _session: SessionHandle,
}

enum ImplicitWrite {
    Update(Statement, RequestOptions),
    Batch(Vec<Statement>, RequestOptions),
    Mutations(Vec<Mutation>),
}

enum ImplicitOutput {
    Count(i64),
    Counts(Vec<i64>),
    Buffered,
}

/// Holds the connection in `AutocommitActive` while an implicit transaction
/// runs. Dropping it, including when the statement future is cancelled,
/// returns the connection to `Idle`.
struct ImplicitActive<'a>(&'a mut ConnectionState);

impl<'a> ImplicitActive<'a> {
    fn enter(state: &'a mut ConnectionState) -> Self {
        *state = ConnectionState::AutocommitActive;
        Self(state)
    }
}

impl Drop for ImplicitActive<'_> {
    fn drop(&mut self) {
        *self.0 = ConnectionState::Idle;
    }
}

pub struct Connection {
    id: ConnectionId,
    backend: Arc<dyn Backend>,
    router: SessionRouter,
    ddl_config: DdlConfig,
    max_attempts: u32,
    environment: Arc<OptionLayer>,
    settings: OptionLayer,
    statement_tag: Option<String>,
    transaction_tag: Option<String>,
    next_isolation: Option<IsolationLevel>,
    autocommit: bool,
    read_only: bool,
    retry_aborts_internally: bool,
    statement_timeout: Option<Duration>,
    state: ConnectionState,
    batch_return_state: ConnectionState,
    transaction: Option<Transaction>,
    dml_batch: Option<DmlBatch>,
    ddl_batch: Option<ActiveDdlBatch>,
    batch_buffer: DmlBatch,
    listeners: RetryListeners,
    last_commit: Option<CommitResponse>,
    last_retry_count: u32,
    closed: bool,
}

impl Connection {
    fn new(runtime: &Runtime) -> Self {
        let config = &runtime.config;
        let id = next_connection_id();
        debug!(connection = %id, "connection opened");
        Self {
            id,
            backend: runtime.backend.clone(),
            router: runtime.router.clone(),
            ddl_config: config.ddl.clone(),
            max_attempts: config.retry.max_attempts,
            environment: config.environment_snapshot(),
            settings: OptionLayer::new(),
            statement_tag: None,
            transaction_tag: None,
            next_isolation: None,
            autocommit: config.autocommit,
            read_only: config.read_only,
            retry_aborts_internally: config.retry.retry_aborts_internally,
            statement_timeout: config.statement_timeout(),
            state: ConnectionState::Idle,
            batch_return_state: ConnectionState::Idle,
            transaction: None,
            dml_batch: None,
            ddl_batch: None,
            batch_buffer: DmlBatch::new(),
            listeners: RetryListeners::new(),
            last_commit: None,
            last_retry_count: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn statement_tag(&self) -> &str {
        self.statement_tag.as_deref().unwrap_or("")
    }

    /// Tag of the open transaction, or the tag the next one will carry.
    pub fn transaction_tag(&self) -> &str {
        match &self.transaction {
            Some(txn) => txn.transaction_tag(),
            None => self.transaction_tag.as_deref().unwrap_or(""),
        }
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.effective(&OptionLayer::new()).isolation_level
    }

    /// Retries of the open transaction, or of the last finished one.
    pub fn retry_count(&self) -> u32 {
        self.transaction
            .as_ref()
            .map_or(self.last_retry_count, Transaction::retry_count)
    }

    pub fn commit_response(&self) -> Option<&CommitResponse> {
        self.last_commit.as_ref()
    }

    /// Options the next statement would be sent with, before hints.
    pub fn effective_options(&self) -> EffectiveOptions {
        self.effective(&OptionLayer::new())
    }

    pub fn add_retry_listener(&mut self, listener: Arc<dyn RetryListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_retry_listener(&mut self, listener: &Arc<dyn RetryListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub async fn execute_sql(&mut self, sql: &str) -> Result<StatementResult, ConnectionError> {
        self.execute(Statement::new(sql), StatementOptions::default())
            .await
    }

    /// Classifies and executes one statement.
    #[instrument(skip_all, fields(connection = %self.id, sql = %statement.sql, state = %self.state))]
    pub async fn execute(
        &mut self,
        statement: Statement,
        options: StatementOptions,
    ) -> Result<StatementResult, ConnectionError> {
        self.ensure_open()?;
        let result = self.dispatch(statement, options).await;
        if let Err(err) = &result {
            self.fail_transaction(err);
        }
        result
    }

    pub async fn execute_query(
        &mut self,
        statement: Statement,
    ) -> Result<ResultSet, ConnectionError> {
        match self.execute(statement, StatementOptions::default()).await? {
            StatementResult::ResultSet(rows) => Ok(rows),
            _ => Err(ConnectionError::InvalidArgument(
                "statement did not return rows".to_string(),
            )),
        }
    }

    /// Executes DML and returns its update count.
    pub async fn execute_update(&mut self, statement: Statement) -> Result<i64, ConnectionError> {
        match self.execute(statement, StatementOptions::default()).await? {
            StatementResult::UpdateCount(count) => Ok(count),
            _ => Err(ConnectionError::InvalidArgument(
                "statement did not return an update count".to_string(),
            )),
        }
    }

    /// Like [`Connection::execute_update`], failing with `OutOfRange` when the
    /// count does not fit in 32 bits.
    pub async fn execute_update_narrow(
        &mut self,
        statement: Statement,
    ) -> Result<i32, ConnectionError> {
        narrow_update_count(self.execute_update(statement).await?)
    }

    /// Adds a DML statement to the client-side batch buffer.
    pub fn add_to_batch(&mut self, statement: Statement) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.ensure_not_batching()?;
        let parsed = ParsedStatement::parse(&statement.sql)?;
        if !parsed.is_dml() {
            return Err(ConnectionError::InvalidArgument(format!(
                "only DML statements can be batched, got {}",
                parsed.kind().name()
            )));
        }
        self.batch_buffer.add(Statement::with_params(parsed.sql(), statement.params));
        Ok(())
    }

    /// Sends the buffered statements as one request. The buffer is empty
    /// afterwards whatever the outcome.
    #[instrument(skip_all, fields(connection = %self.id, statements = self.batch_buffer.len()))]
    pub async fn execute_batch(&mut self) -> Result<Vec<i64>, ConnectionError> {
        let statements = self.batch_buffer.take();
        self.ensure_open()?;
        self.ensure_not_batching()?;
        let timeout = self.statement_timeout;
        let result = self
            .run_batch_update(statements, &OptionLayer::new(), timeout)
            .await;
        if let Err(err) = &result {
            self.fail_transaction(err);
        }
        result
    }

    pub async fn execute_batch_narrow(&mut self) -> Result<Vec<i32>, ConnectionError> {
        narrow_update_counts(&self.execute_batch().await?)
    }

    pub fn clear_batch(&mut self) {
        self.batch_buffer.take();
    }

    /// Buffers a mutation. In autocommit mode it is committed immediately.
    pub async fn buffer_write(&mut self, mutation: Mutation) -> Result<(), ConnectionError> {
        self.buffer_writes(vec![mutation]).await
    }

    pub async fn buffer_writes(&mut self, mutations: Vec<Mutation>) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.ensure_not_batching()?;
        let flags = self.transaction_flags();
        if flags.failed {
            return Err(failed_transaction());
        }
        if flags.read_only {
            return Err(ConnectionError::FailedPrecondition(
                "mutations are not allowed in read-only mode".to_string(),
            ));
        }

        let result = if self.transaction.is_some() || !self.autocommit {
            self.ensure_transaction(&OptionLayer::new())
                .and_then(|()| self.transaction_mut()?.buffer_mutations(mutations))
        } else {
            let effective = self.take_statement_options(&OptionLayer::new());
            let timeout = self.statement_timeout;
            self.run_implicit(ImplicitWrite::Mutations(mutations), &effective, timeout)
                .await
                .map(|_| ())
        };
        if let Err(err) = &result {
            self.fail_transaction(err);
        }
        result
    }

    /// Starts an explicit transaction.
    pub async fn begin(&mut self) -> Result<(), ConnectionError> {
        self.begin_with(None).await
    }

    pub async fn begin_with(
        &mut self,
        isolation_level: Option<IsolationLevel>,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        check_statement(
            self.state,
            &StatementKind::ClientCommand(ClientCommand::Begin { isolation_level }),
            self.transaction_flags(),
        )?;
        let mut layer = OptionLayer::new();
        layer.isolation_level = isolation_level;
        self.ensure_transaction(&layer)
    }

    /// Commits the open transaction. Without one this is a no-op.
    #[instrument(skip_all, fields(connection = %self.id, state = %self.state))]
    pub async fn commit(&mut self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.ensure_not_batching()?;
        if self.transaction.is_none() {
            info!("commit without an active transaction");
            return Ok(());
        }

        let effective = self.effective(&OptionLayer::new());
        let timeout = self.statement_timeout;
        let settings = CommitSettings {
            options: RequestOptions {
                request_tag: String::new(),
                ..effective.request_options(deadline(timeout))
            },
            max_commit_delay: effective.max_commit_delay,
            return_commit_stats: effective.return_commit_stats,
        };

        let Self {
            backend,
            router,
            listeners,
            transaction,
            ..
        } = &mut *self;
        let ctx = TxContext {
            backend: backend.as_ref(),
            router,
            listeners,
        };
        let txn = transaction.as_mut().ok_or_else(no_transaction)?;
        let result = with_timeout(timeout, TimeoutOutcome::Unknown, txn.commit(ctx, settings)).await;
        match result {
            Ok(response) => {
                self.last_commit = response;
                self.end_transaction();
                Ok(())
            }
            Err(err) => {
                txn.mark_failed();
                Err(err)
            }
        }
    }

    /// Rolls back the open transaction. Without one this is a no-op.
    #[instrument(skip_all, fields(connection = %self.id, state = %self.state))]
    pub async fn rollback(&mut self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if self.state == ConnectionState::DdlBatch {
            return Err(ConnectionError::FailedPrecondition(
                "cannot roll back while a DDL batch is active".to_string(),
            ));
        }
        if self.state == ConnectionState::DmlBatch {
            self.dml_batch = None;
        }
        let Some(mut txn) = self.transaction.take() else {
            info!("rollback without an active transaction");
            self.state = ConnectionState::Idle;
            return Ok(());
        };
        let ctx = TxContext {
            backend: self.backend.as_ref(),
            router: &self.router,
            listeners: &self.listeners,
        };
        txn.rollback(ctx).await;
        self.transaction = Some(txn);
        self.end_transaction();
        Ok(())
    }

    pub async fn set_savepoint(&mut self, name: Option<&str>) -> Result<Savepoint, ConnectionError> {
        self.ensure_open()?;
        self.ensure_savepoint_transaction()?;
        let result = self.transaction_mut()?.set_savepoint(name);
        if let Err(err) = &result {
            self.fail_transaction(err);
        }
        result
    }

    pub async fn rollback_to_savepoint(
        &mut self,
        savepoint: &Savepoint,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.ensure_savepoint_transaction()?;
        let Self {
            backend,
            router,
            listeners,
            transaction,
            ..
        } = &mut *self;
        let ctx = TxContext {
            backend: backend.as_ref(),
            router,
            listeners,
        };
        let txn = transaction.as_mut().ok_or_else(no_transaction)?;
        let result = txn.rollback_to_savepoint(ctx, savepoint).await;
        if result.is_err() {
            txn.mark_failed();
        }
        result
    }

    pub async fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.ensure_savepoint_transaction()?;
        let result = self.transaction_mut()?.release_savepoint(savepoint);
        if let Err(err) = &result {
            self.fail_transaction(err);
        }
        result
    }

    pub fn set_autocommit(&mut self, autocommit: bool) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if autocommit == self.autocommit {
            return Ok(());
        }
        self.ensure_no_pending_work("autocommit")?;
        self.discard_unused_transaction();
        self.autocommit = autocommit;
        debug!(autocommit, "autocommit changed");
        Ok(())
    }

    pub fn set_read_only(&mut self, read_only: bool) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if read_only == self.read_only {
            return Ok(());
        }
        self.ensure_no_pending_work("read-only mode")?;
        self.discard_unused_transaction();
        self.read_only = read_only;
        Ok(())
    }

    /// Default isolation level for transactions started after this call.
    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.ensure_no_pending_work("the isolation level")?;
        self.settings.isolation_level = Some(level);
        Ok(())
    }

    pub fn set_retry_aborts_internally(&mut self, enabled: bool) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.retry_aborts_internally = enabled;
        Ok(())
    }

    /// Tag applied to the next statement only.
    pub fn set_statement_tag(&mut self, tag: impl Into<String>) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let tag = tag.into();
        self.statement_tag = (!tag.is_empty()).then_some(tag);
        Ok(())
    }

    /// Tag for the current or next transaction, kept until it commits or
    /// rolls back.
    pub fn set_transaction_tag(&mut self, tag: impl Into<String>) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let tag = tag.into();
        match self.transaction.as_ref().map(Transaction::has_work) {
            Some(true) => {
                return Err(ConnectionError::FailedPrecondition(
                    "the transaction tag cannot change after the transaction has started"
                        .to_string(),
                ))
            }
            Some(false) => {
                self.replace_unused_transaction(|settings| settings.transaction_tag = tag.clone())
            }
            None => {}
        }
        self.transaction_tag = (!tag.is_empty()).then_some(tag);
        Ok(())
    }

    pub fn set_statement_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.statement_timeout = timeout.filter(|t| !t.is_zero());
        Ok(())
    }

    pub fn set_optimizer_version(&mut self, version: impl Into<String>) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.settings.optimizer_version = Some(version.into());
        Ok(())
    }

    pub fn set_options(&mut self, layer: OptionLayer) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.settings = layer.or(&self.settings);
        Ok(())
    }

    pub async fn start_batch_ddl(&mut self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        check_statement(
            self.state,
            &StatementKind::BatchControl(BatchControl::StartDdl),
            self.transaction_flags(),
        )?;
        let session = self.router.acquire(OperationKind::DdlBatch, true).await?;
        self.ddl_batch = Some(ActiveDdlBatch {
            batch: DdlBatch::new(),
            _session: session,
        });
        self.batch_return_state = self.state;
        self.state = ConnectionState::DdlBatch;
        info!("DDL batch started");
        Ok(())
    }

    pub fn start_batch_dml(&mut self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        check_statement(
            self.state,
            &StatementKind::BatchControl(BatchControl::StartDml),
            self.transaction_flags(),
        )?;
        self.dml_batch = Some(DmlBatch::new());
        self.batch_return_state = self.state;
        self.state = ConnectionState::DmlBatch;
        debug!("DML batch started");
        Ok(())
    }

    /// Runs the active DDL or DML batch and returns to the previous state.
    #[instrument(skip_all, fields(connection = %self.id, state = %self.state))]
    pub async fn run_batch(&mut self) -> Result<StatementResult, ConnectionError> {
        self.ensure_open()?;
        let timeout = self.statement_timeout;
        match self.state {
            ConnectionState::DdlBatch => {
                let active = self.ddl_batch.take();
                self.state = self.batch_return_state;
                let Some(mut active) = active else {
                    return Ok(StatementResult::NoResult);
                };
                let statements = active.batch.take();
                info!(statements = statements.len(), "running DDL batch");
                with_timeout(
                    timeout,
                    TimeoutOutcome::Unknown,
                    run_ddl(self.backend.as_ref(), &statements, &self.ddl_config),
                )
                .await?;
                Ok(StatementResult::NoResult)
            }
            ConnectionState::DmlBatch => {
                let statements = self.dml_batch.take().map(|mut b| b.take()).unwrap_or_default();
                self.state = self.batch_return_state;
                debug!(statements = statements.len(), "running DML batch");
                let result = self
                    .run_batch_update(statements, &OptionLayer::new(), timeout)
                    .await;
                if let Err(err) = &result {
                    self.fail_transaction(err);
                }
                result.map(StatementResult::UpdateCounts)
            }
            _ => Err(ConnectionError::FailedPrecondition(
                "no batch is active".to_string(),
            )),
        }
    }

    /// Discards the active batch.
    pub fn abort_batch(&mut self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        match self.state {
            ConnectionState::DdlBatch | ConnectionState::DmlBatch => {
                self.ddl_batch = None;
                self.dml_batch = None;
                self.state = self.batch_return_state;
                debug!("batch aborted");
                Ok(())
            }
            _ => Err(ConnectionError::FailedPrecondition(
                "no batch is active".to_string(),
            )),
        }
    }

    /// Rolls back any open transaction, drops pending batches and releases
    /// the session. Further calls fail.
    #[instrument(skip_all, fields(connection = %self.id))]
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.ddl_batch = None;
        self.dml_batch = None;
        self.batch_buffer.take();
        if let Some(mut txn) = self.transaction.take() {
            let ctx = TxContext {
                backend: self.backend.as_ref(),
                router: &self.router,
                listeners: &self.listeners,
            };
            txn.rollback(ctx).await;
        }
        self.state = ConnectionState::Idle;
        self.closed = true;
        debug!("connection closed");
    }

    /// Sets a connection variable from its textual value.
    pub fn set_variable(&mut self, variable: Variable, value: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let text = |value: &str| -> String {
            if value.eq_ignore_ascii_case("NULL") {
                String::new()
            } else {
                value.to_string()
            }
        };
        match variable {
            Variable::CommitTimestamp | Variable::CommitResponse | Variable::RetryCount => {
                Err(ConnectionError::InvalidArgument(format!(
                    "variable {variable} is read-only"
                )))
            }
            Variable::Autocommit => self.set_autocommit(parse_bool(value)?),
            Variable::ReadOnly => self.set_read_only(parse_bool(value)?),
            Variable::RetryAbortsInternally => self.set_retry_aborts_internally(parse_bool(value)?),
            Variable::StatementTag => self.set_statement_tag(text(value)),
            Variable::TransactionTag => self.set_transaction_tag(text(value)),
            Variable::OptimizerVersion => {
                self.settings.optimizer_version = Some(text(value));
                Ok(())
            }
            Variable::OptimizerStatisticsPackage => {
                self.settings.optimizer_statistics_package = Some(text(value));
                Ok(())
            }
            Variable::RpcPriority => {
                self.settings.rpc_priority = Some(value.parse()?);
                Ok(())
            }
            Variable::MaxCommitDelay => {
                self.settings.max_commit_delay = parse_duration(value)?;
                Ok(())
            }
            Variable::ReturnCommitStats => {
                self.settings.return_commit_stats = Some(parse_bool(value)?);
                Ok(())
            }
            Variable::StatementTimeout => self.set_statement_timeout(parse_duration(value)?),
            Variable::IsolationLevel => self.set_isolation_level(value.parse()?),
        }
    }

    /// Current value of a connection variable as a one-row result.
    pub fn show_variable(&self, variable: Variable) -> ResultSet {
        let effective = self.effective(&OptionLayer::new());
        let name = variable.name();
        match variable {
            Variable::Autocommit => ResultSet::single(name, Value::Bool(self.autocommit)),
            Variable::ReadOnly => ResultSet::single(name, Value::Bool(self.read_only)),
            Variable::RetryAbortsInternally => {
                ResultSet::single(name, Value::Bool(self.retry_aborts_internally))
            }
            Variable::StatementTag => ResultSet::single(name, Value::from(self.statement_tag())),
            Variable::TransactionTag => {
                ResultSet::single(name, Value::from(self.transaction_tag()))
            }
            Variable::OptimizerVersion => {
                ResultSet::single(name, Value::String(effective.optimizer_version))
            }
            Variable::OptimizerStatisticsPackage => {
                ResultSet::single(name, Value::String(effective.optimizer_statistics_package))
            }
            Variable::RpcPriority => {
                ResultSet::single(name, Value::String(effective.rpc_priority.to_string()))
            }
            Variable::MaxCommitDelay => ResultSet::single(
                name,
                Value::String(format_duration(effective.max_commit_delay)),
            ),
            Variable::ReturnCommitStats => {
                ResultSet::single(name, Value::Bool(effective.return_commit_stats))
            }
            Variable::StatementTimeout => ResultSet::single(
                name,
                Value::String(format_duration(self.statement_timeout)),
            ),
            Variable::IsolationLevel => {
                ResultSet::single(name, Value::String(effective.isolation_level.to_string()))
            }
            Variable::CommitTimestamp => ResultSet::single(
                name,
                self.last_commit
                    .as_ref()
                    .map_or(Value::Null, |c| Value::Timestamp(c.commit_timestamp)),
            ),
            Variable::CommitResponse => {
                let (timestamp, mutations) = match &self.last_commit {
                    Some(commit) => (
                        Value::Timestamp(commit.commit_timestamp),
                        commit
                            .commit_stats
                            .map_or(Value::Null, |s| Value::Int64(s.mutation_count)),
                    ),
                    None => (Value::Null, Value::Null),
                };
                ResultSet::new(
                    vec!["COMMIT_TIMESTAMP".to_string(), "MUTATION_COUNT".to_string()],
                    vec![vec![timestamp, mutations]],
                )
            }
            Variable::RetryCount => {
                ResultSet::single(name, Value::Int64(i64::from(self.retry_count())))
            }
        }
    }

    async fn dispatch(
        &mut self,
        statement: Statement,
        options: StatementOptions,
    ) -> Result<StatementResult, ConnectionError> {
        let parsed = ParsedStatement::parse(&statement.sql)?;
        check_statement(self.state, parsed.kind(), self.transaction_flags())?;
        debug!(kind = parsed.kind().name(), "classified statement");

        let overrides = options.overrides.or(parsed.overrides());
        let timeout = options.timeout.or(self.statement_timeout);
        let statement = Statement::with_params(parsed.sql(), statement.params);

        match parsed.kind().clone() {
            StatementKind::ClientCommand(command) => self.execute_client_command(command).await,
            StatementKind::BatchControl(control) => match control {
                BatchControl::StartDdl => {
                    self.start_batch_ddl().await?;
                    Ok(StatementResult::NoResult)
                }
                BatchControl::StartDml => {
                    self.start_batch_dml()?;
                    Ok(StatementResult::NoResult)
                }
                BatchControl::Run => self.run_batch().await,
                BatchControl::Abort => {
                    self.abort_batch()?;
                    Ok(StatementResult::NoResult)
                }
            },
            StatementKind::Ddl => self.execute_ddl(statement.sql, timeout).await,
            StatementKind::Query => self
                .run_query(statement, &overrides, timeout)
                .await
                .map(StatementResult::ResultSet),
            StatementKind::Dml => {
                if let Some(batch) = self.dml_batch.as_mut() {
                    batch.add(statement);
                    return Ok(StatementResult::NoResult);
                }
                self.run_update(statement, &overrides, timeout)
                    .await
                    .map(StatementResult::UpdateCount)
            }
        }
    }

    async fn execute_client_command(
        &mut self,
        command: ClientCommand,
    ) -> Result<StatementResult, ConnectionError> {
        match command {
            ClientCommand::Begin { isolation_level } => self.begin_with(isolation_level).await?,
            ClientCommand::Commit => self.commit().await?,
            ClientCommand::Rollback => self.rollback().await?,
            ClientCommand::Savepoint(name) => {
                self.set_savepoint(Some(&name)).await?;
            }
            ClientCommand::RollbackToSavepoint(name) => {
                self.rollback_to_savepoint(&Savepoint::Named(name)).await?
            }
            ClientCommand::ReleaseSavepoint(name) => {
                self.release_savepoint(&Savepoint::Named(name)).await?
            }
            ClientCommand::Set { variable, value } => self.set_variable(variable, &value)?,
            ClientCommand::Show(variable) => {
                return Ok(StatementResult::ResultSet(self.show_variable(variable)))
            }
            ClientCommand::SetTransactionIsolation(level) => {
                self.set_transaction_isolation(level)?
            }
        }
        Ok(StatementResult::NoResult)
    }

    async fn execute_ddl(
        &mut self,
        sql: String,
        timeout: Option<Duration>,
    ) -> Result<StatementResult, ConnectionError> {
        if let Some(active) = self.ddl_batch.as_mut() {
            active.batch.add(sql);
            return Ok(StatementResult::NoResult);
        }
        info!("executing DDL");
        with_timeout(
            timeout,
            TimeoutOutcome::Unknown,
            run_ddl(self.backend.as_ref(), &[sql], &self.ddl_config),
        )
        .await?;
        Ok(StatementResult::NoResult)
    }

    async fn run_query(
        &mut self,
        statement: Statement,
        overrides: &OptionLayer,
        timeout: Option<Duration>,
    ) -> Result<ResultSet, ConnectionError> {
        if self.transaction.is_none() && !self.autocommit {
            self.ensure_transaction(overrides)?;
        }
        self.apply_statement_transaction_tag(overrides)?;
        let effective = self.take_statement_options(overrides);
        let request = effective.request_options(deadline(timeout));

        if self.transaction.is_some() {
            let Self {
                backend,
                router,
                listeners,
                transaction,
                ..
            } = &mut *self;
            let ctx = TxContext {
                backend: backend.as_ref(),
                router,
                listeners,
            };
            let txn = transaction.as_mut().ok_or_else(no_transaction)?;
            let request = RequestOptions {
                transaction_tag: txn.transaction_tag().to_string(),
                ..request
            };
            return with_timeout(
                timeout,
                TimeoutOutcome::NotExecuted,
                txn.query(ctx, statement, request),
            )
            .await;
        }

        let session = self.router.acquire(OperationKind::Query, false).await?;
        let backend = self.backend.clone();
        with_timeout(timeout, TimeoutOutcome::NotExecuted, async move {
            backend
                .execute_query(
                    session.session(),
                    &TransactionSelector::SingleUseReadOnly,
                    &statement,
                    &request,
                )
                .await
                .map_err(ConnectionError::from)
        })
        .await
    }

    async fn run_update(
        &mut self,
        statement: Statement,
        overrides: &OptionLayer,
        timeout: Option<Duration>,
    ) -> Result<i64, ConnectionError> {
        if self.transaction.is_none() && !self.autocommit {
            self.ensure_transaction(overrides)?;
        }
        self.apply_statement_transaction_tag(overrides)?;
        let effective = self.take_statement_options(overrides);
        let request = effective.request_options(deadline(timeout));

        if self.transaction.is_none() {
            return match self
                .run_implicit(ImplicitWrite::Update(statement, request), &effective, timeout)
                .await?
            {
                ImplicitOutput::Count(count) => Ok(count),
                _ => Err(ConnectionError::Internal(
                    "implicit update returned no count".to_string(),
                )),
            };
        }

        let Self {
            backend,
            router,
            listeners,
            transaction,
            ..
        } = &mut *self;
        let ctx = TxContext {
            backend: backend.as_ref(),
            router,
            listeners,
        };
        let txn = transaction.as_mut().ok_or_else(no_transaction)?;
        let request = RequestOptions {
            transaction_tag: txn.transaction_tag().to_string(),
            ..request
        };
        with_timeout(timeout, TimeoutOutcome::Unknown, txn.update(ctx, statement, request)).await
    }

    async fn run_batch_update(
        &mut self,
        statements: Vec<Statement>,
        overrides: &OptionLayer,
        timeout: Option<Duration>,
    ) -> Result<Vec<i64>, ConnectionError> {
        if statements.is_empty() {
            return Ok(Vec::new());
        }
        if self.read_only || self.transaction.as_ref().is_some_and(Transaction::is_read_only) {
            return Err(ConnectionError::FailedPrecondition(
                "DML is not allowed in read-only mode".to_string(),
            ));
        }
        if self.transaction.is_none() && !self.autocommit {
            self.ensure_transaction(overrides)?;
        }
        self.apply_statement_transaction_tag(overrides)?;
        let effective = self.take_statement_options(overrides);
        let request = effective.request_options(deadline(timeout));

        if self.transaction.is_none() {
            return match self
                .run_implicit(ImplicitWrite::Batch(statements, request), &effective, timeout)
                .await?
            {
                ImplicitOutput::Counts(counts) => Ok(counts),
                _ => Err(ConnectionError::Internal(
                    "implicit batch returned no counts".to_string(),
                )),
            };
        }

        let Self {
            backend,
            router,
            listeners,
            transaction,
            ..
        } = &mut *self;
        let ctx = TxContext {
            backend: backend.as_ref(),
            router,
            listeners,
        };
        let txn = transaction.as_mut().ok_or_else(no_transaction)?;
        if txn.is_failed() {
            return Err(failed_transaction());
        }
        let request = RequestOptions {
            transaction_tag: txn.transaction_tag().to_string(),
            ..request
        };
        with_timeout(
            timeout,
            TimeoutOutcome::Unknown,
            txn.batch_update(ctx, statements, request),
        )
        .await
    }

    /// Runs one write as its own transaction and commits it. On failure the
    /// implicit transaction is rolled back.
    async fn run_implicit(
        &mut self,
        write: ImplicitWrite,
        effective: &EffectiveOptions,
        timeout: Option<Duration>,
    ) -> Result<ImplicitOutput, ConnectionError> {
        let mut txn = Transaction::new(TransactionKind::Implicit, self.transaction_settings(effective));
        let commit = CommitSettings {
            options: RequestOptions {
                request_tag: String::new(),
                ..effective.request_options(deadline(timeout))
            },
            max_commit_delay: effective.max_commit_delay,
            return_commit_stats: effective.return_commit_stats,
        };
        let _active = ImplicitActive::enter(&mut self.state);

        let ctx = TxContext {
            backend: self.backend.as_ref(),
            router: &self.router,
            listeners: &self.listeners,
        };
        let work = async {
            let output = match write {
                ImplicitWrite::Update(statement, request) => {
                    ImplicitOutput::Count(txn.update(ctx, statement, request).await?)
                }
                ImplicitWrite::Batch(statements, request) => {
                    ImplicitOutput::Counts(txn.batch_update(ctx, statements, request).await?)
                }
                ImplicitWrite::Mutations(mutations) => {
                    txn.buffer_mutations(mutations)?;
                    ImplicitOutput::Buffered
                }
            };
            let response = txn.commit(ctx, commit).await?;
            Ok::<_, ConnectionError>((output, response))
        };
        let result = with_timeout(timeout, TimeoutOutcome::Unknown, work).await;

        self.last_retry_count = txn.retry_count();
        self.transaction_tag = None;
        match result {
            Ok((output, response)) => {
                self.last_commit = response;
                Ok(output)
            }
            Err(err) => {
                let ctx = TxContext {
                    backend: self.backend.as_ref(),
                    router: &self.router,
                    listeners: &self.listeners,
                };
                txn.rollback(ctx).await;
                Err(err)
            }
        }
    }

    /// A transaction tag given for a single statement applies to the open
    /// transaction. It can only change before the transaction did any work.
    fn apply_statement_transaction_tag(
        &mut self,
        overrides: &OptionLayer,
    ) -> Result<(), ConnectionError> {
        let Some(tag) = overrides.transaction_tag.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        let open = self
            .transaction
            .as_ref()
            .map(|txn| (txn.transaction_tag() == tag, txn.has_work()));
        match open {
            None | Some((true, _)) => Ok(()),
            Some((false, true)) => Err(ConnectionError::FailedPrecondition(format!(
                "transaction tag {tag:?} cannot be applied after the transaction has started"
            ))),
            Some((false, false)) => {
                let tag = tag.to_string();
                self.replace_unused_transaction(|settings| settings.transaction_tag = tag);
                Ok(())
            }
        }
    }

    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<(), ConnectionError> {
        match self.transaction.as_ref().map(Transaction::has_work) {
            Some(true) => Err(ConnectionError::FailedPrecondition(
                "the isolation level cannot change after the transaction has started".to_string(),
            )),
            Some(false) => {
                self.replace_unused_transaction(|settings| settings.isolation_level = level);
                Ok(())
            }
            None => {
                self.next_isolation = Some(level);
                Ok(())
            }
        }
    }

    fn ensure_transaction(&mut self, statement_layer: &OptionLayer) -> Result<(), ConnectionError> {
        if self.transaction.is_some() {
            return Ok(());
        }
        let mut layer = statement_layer.clone();
        if layer.isolation_level.is_none() {
            layer.isolation_level = self.next_isolation;
        }
        self.next_isolation = None;
        let effective = self.effective(&layer);
        let settings = self.transaction_settings(&effective);
        info!(
            read_only = settings.read_only,
            isolation = %settings.isolation_level,
            tag = %settings.transaction_tag,
            "transaction begun"
        );
        self.transaction = Some(Transaction::new(TransactionKind::Explicit, settings));
        self.state = ConnectionState::ExplicitTransaction;
        Ok(())
    }

    fn transaction_settings(&self, effective: &EffectiveOptions) -> TransactionSettings {
        TransactionSettings {
            read_only: self.read_only,
            isolation_level: effective.isolation_level,
            transaction_tag: effective.transaction_tag.clone(),
            retry_aborts_internally: self.retry_aborts_internally,
            max_attempts: self.max_attempts,
        }
    }

    /// Rebuilds a transaction that has not done anything yet with changed
    /// settings.
    fn replace_unused_transaction(&mut self, change: impl FnOnce(&mut TransactionSettings)) {
        if let Some(txn) = self.transaction.take() {
            let mut settings = TransactionSettings {
                read_only: txn.is_read_only(),
                isolation_level: txn.isolation_level(),
                transaction_tag: txn.transaction_tag().to_string(),
                retry_aborts_internally: self.retry_aborts_internally,
                max_attempts: self.max_attempts,
            };
            change(&mut settings);
            self.transaction = Some(Transaction::new(txn.kind(), settings));
        }
    }

    fn discard_unused_transaction(&mut self) {
        if self.transaction.as_ref().is_some_and(|txn| !txn.has_work()) {
            self.transaction = None;
            self.state = ConnectionState::Idle;
        }
    }

    fn end_transaction(&mut self) {
        if let Some(txn) = self.transaction.take() {
            self.last_retry_count = txn.retry_count();
        }
        self.transaction_tag = None;
        self.next_isolation = None;
        self.state = ConnectionState::Idle;
    }

    fn connection_layer(&self) -> OptionLayer {
        let mut layer = self.settings.clone();
        layer.statement_tag = self.statement_tag.clone();
        layer.transaction_tag = match &self.transaction {
            Some(txn) => Some(txn.transaction_tag().to_string()),
            None => self.transaction_tag.clone(),
        };
        layer
    }

    fn effective(&self, statement: &OptionLayer) -> EffectiveOptions {
        resolve(&self.environment, &self.connection_layer(), statement)
    }

    /// Resolves options for a statement sent to the backend, consuming the
    /// one-shot statement tag.
    fn take_statement_options(&mut self, statement: &OptionLayer) -> EffectiveOptions {
        let effective = self.effective(statement);
        self.statement_tag = None;
        effective
    }

    fn transaction_flags(&self) -> TransactionFlags {
        match &self.transaction {
            Some(txn) => txn.flags(),
            None => TransactionFlags {
                read_only: self.read_only,
                ..TransactionFlags::default()
            },
        }
    }

    fn transaction_mut(&mut self) -> Result<&mut Transaction, ConnectionError> {
        self.transaction.as_mut().ok_or_else(no_transaction)
    }

    /// Leaves an explicit transaction in its error state after a failed
    /// statement. Implicit transactions are already gone.
    fn fail_transaction(&mut self, err: &ConnectionError) {
        if let Some(txn) = self.transaction.as_mut() {
            if !txn.is_failed() {
                warn!(error = %err, "statement failed, transaction requires rollback");
            }
            txn.mark_failed();
        }
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::FailedPrecondition(
                "connection is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_not_batching(&self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::DdlBatch | ConnectionState::DmlBatch => {
                Err(ConnectionError::FailedPrecondition(format!(
                    "not allowed while a batch is active ({})",
                    self.state
                )))
            }
            _ => Ok(()),
        }
    }

    fn ensure_no_pending_work(&self, what: &str) -> Result<(), ConnectionError> {
        self.ensure_not_batching()?;
        if self.transaction.as_ref().is_some_and(Transaction::has_work) {
            return Err(ConnectionError::FailedPrecondition(format!(
                "cannot change {what} while a transaction is active"
            )));
        }
        Ok(())
    }

    fn ensure_savepoint_transaction(&mut self) -> Result<(), ConnectionError> {
        self.ensure_not_batching()?;
        if self.transaction.is_some() {
            return Ok(());
        }
        if self.autocommit {
            return Err(ConnectionError::FailedPrecondition(
                "savepoints require an active transaction".to_string(),
            ));
        }
        self.ensure_transaction(&OptionLayer::new())
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|limit| Instant::now() + limit)
}

/// Bounds `future` by `timeout`. Timeouts, including deadline errors from the
/// backend, carry `outcome`.
async fn with_timeout<T>(
    timeout: Option<Duration>,
    outcome: TimeoutOutcome,
    future: impl Future<Output = Result<T, ConnectionError>>,
) -> Result<T, ConnectionError> {
    let result = match timeout {
        None => future.await,
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => {
                return Err(ConnectionError::timeout(
                    outcome,
                    format!("statement timed out after {}ms", limit.as_millis()),
                ))
            }
        },
    };
    result.map_err(|err| err.with_timeout_outcome(outcome))
}

fn no_transaction() -> ConnectionError {
    ConnectionError::Internal("no active transaction".to_string())
}

fn failed_transaction() -> ConnectionError {
    ConnectionError::FailedPrecondition(
        "the current transaction has failed and must be rolled back".to_string(),
    )
}
