//! Backend sessions: identifiers, the exclusive session pool and the router
//! that picks a session for each operation.

pub mod id;
pub mod pool;
pub mod router;

pub use id::{ConnectionId, SavepointId, TransactionId};
pub use pool::{ExclusiveSession, ExhaustionPolicy, PoolConfig, PoolSnapshot, SessionPool};
pub use router::{requires_exclusive, OperationKind, SessionHandle, SessionRouter};
