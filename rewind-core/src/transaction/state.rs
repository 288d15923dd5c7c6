//! Connection-level transaction modes and statement legality.

use std::fmt;

use crate::error::ConnectionError;
use crate::sql::{BatchControl, ClientCommand, StatementKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// An implicit single-statement transaction is running.
    AutocommitActive,
    ExplicitTransaction,
    DdlBatch,
    DmlBatch,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::AutocommitActive => "autocommit_active",
            ConnectionState::ExplicitTransaction => "explicit_transaction",
            ConnectionState::DdlBatch => "ddl_batch",
            ConnectionState::DmlBatch => "dml_batch",
        };
        f.write_str(name)
    }
}

/// What the legality check needs to know about the open transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionFlags {
    pub active: bool,
    pub failed: bool,
    pub has_writes: bool,
    pub read_only: bool,
}

/// Rejects statements that are not allowed in the current state.
pub fn check_statement(
    state: ConnectionState,
    kind: &StatementKind,
    txn: TransactionFlags,
) -> Result<(), ConnectionError> {
    if txn.active && txn.failed && !allowed_in_failed_transaction(kind) {
        return Err(ConnectionError::FailedPrecondition(
            "the current transaction has failed and must be rolled back".to_string(),
        ));
    }

    match state {
        ConnectionState::DdlBatch => match kind {
            StatementKind::Ddl
            | StatementKind::BatchControl(BatchControl::Run | BatchControl::Abort)
            | StatementKind::ClientCommand(ClientCommand::Show(_)) => Ok(()),
            _ => Err(precondition("only DDL statements are allowed in a DDL batch")),
        },
        ConnectionState::DmlBatch => match kind {
            StatementKind::Dml
            | StatementKind::BatchControl(BatchControl::Run | BatchControl::Abort)
            | StatementKind::ClientCommand(ClientCommand::Show(_)) => Ok(()),
            _ => Err(precondition("only DML statements are allowed in a DML batch")),
        },
        ConnectionState::Idle
        | ConnectionState::AutocommitActive
        | ConnectionState::ExplicitTransaction => check_outside_batch(kind, txn),
    }
}

fn check_outside_batch(kind: &StatementKind, txn: TransactionFlags) -> Result<(), ConnectionError> {
    match kind {
        StatementKind::BatchControl(BatchControl::Run | BatchControl::Abort) => {
            Err(precondition("no batch is active"))
        }
        StatementKind::BatchControl(BatchControl::StartDdl) if txn.active => Err(precondition(
            "cannot start a DDL batch while a transaction is active",
        )),
        StatementKind::BatchControl(BatchControl::StartDml) if txn.read_only => Err(
            precondition("cannot start a DML batch in a read-only transaction"),
        ),
        StatementKind::Ddl if txn.active && txn.has_writes => Err(precondition(
            "DDL statements cannot be executed in a transaction with pending writes",
        )),
        StatementKind::Ddl | StatementKind::Dml if txn.read_only => Err(precondition(
            "write statements are not allowed in a read-only transaction",
        )),
        StatementKind::ClientCommand(ClientCommand::Begin { .. }) if txn.active => {
            Err(precondition("a transaction is already active"))
        }
        _ => Ok(()),
    }
}

fn allowed_in_failed_transaction(kind: &StatementKind) -> bool {
    matches!(
        kind,
        StatementKind::ClientCommand(ClientCommand::Rollback | ClientCommand::Show(_))
    )
}

fn precondition(message: &str) -> ConnectionError {
    ConnectionError::FailedPrecondition(message.to_string())
}
