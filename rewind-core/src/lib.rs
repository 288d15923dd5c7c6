//! Client-side connection runtime for a transactional SQL database.
//!
//! The runtime classifies statements, routes them to a shared or exclusive
//! backend session, tracks connection and transaction state, batches DML and
//! DDL, and transparently replays read-write transactions the backend aborts.
//! The backend itself is abstracted behind [`backend::Backend`].

pub mod backend;
pub mod batch;
pub mod config;
pub mod connection;
pub mod ddl;
pub mod error;
pub mod options;
pub mod session;
pub mod sql;
pub mod transaction;
pub mod types;

pub use config::RuntimeConfig;
pub use connection::{Connection, Runtime, StatementOptions, StatementResult};
pub use error::{ConnectionError, ErrorKind, TimeoutOutcome};
pub use options::{IsolationLevel, OptionLayer, RpcPriority};
pub use session::{ExhaustionPolicy, PoolConfig, PoolSnapshot};
pub use transaction::{
    ConnectionState, ReplayOutcome, RetryListener, RetryResult, Savepoint,
};
pub use types::{Mutation, ResultSet, Statement, Value};
