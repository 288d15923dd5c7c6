//! Chooses between the shared session and an exclusive pooled session.

use tracing::debug;

use super::pool::{ExclusiveSession, SessionPool};
use crate::backend::BackendSession;
use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Dml,
    BatchDml,
    Mutation,
    /// A DDL batch holds its session until `RUN BATCH` / `ABORT BATCH`.
    DdlBatch,
}

/// Reads without read-write intent can share a session; everything that
/// writes or belongs to a read-write transaction needs one of its own.
pub fn requires_exclusive(kind: OperationKind, read_write_intent: bool) -> bool {
    match kind {
        OperationKind::Query => read_write_intent,
        OperationKind::Dml
        | OperationKind::BatchDml
        | OperationKind::Mutation
        | OperationKind::DdlBatch => true,
    }
}

#[derive(Debug)]
pub enum SessionHandle {
    Shared(BackendSession),
    Exclusive(ExclusiveSession),
}

impl SessionHandle {
    pub fn session(&self) -> &BackendSession {
        match self {
            SessionHandle::Shared(session) => session,
            SessionHandle::Exclusive(exclusive) => exclusive.session(),
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, SessionHandle::Exclusive(_))
    }

    /// Returns an exclusive session to the pool. Safe to call repeatedly;
    /// a no-op for the shared session.
    pub fn release(&mut self) {
        if let SessionHandle::Exclusive(exclusive) = self {
            exclusive.release();
        }
    }
}

#[derive(Clone)]
pub struct SessionRouter {
    pool: SessionPool,
}

impl SessionRouter {
    pub fn new(pool: SessionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub async fn acquire(
        &self,
        kind: OperationKind,
        read_write_intent: bool,
    ) -> Result<SessionHandle, ConnectionError> {
        if !requires_exclusive(kind, read_write_intent) {
            if let Some(shared) = self.pool.shared_session().await? {
                debug!(?kind, session = %shared.name(), "routed to shared session");
                return Ok(SessionHandle::Shared(shared));
            }
        }
        let exclusive = self.pool.acquire_exclusive().await?;
        debug!(?kind, read_write_intent, session = %exclusive.session().name(), "routed to exclusive session");
        Ok(SessionHandle::Exclusive(exclusive))
    }
}
