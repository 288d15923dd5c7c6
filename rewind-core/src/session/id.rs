//! Identifiers for connections, backend transactions and savepoints.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Backend-assigned transaction identifier (opaque to the client).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    /// Create a new random transaction ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TransactionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

macro_rules! define_id_type {
    ($name:ident, $generator:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            pub fn id(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        #[derive(Debug)]
        pub struct $generator {
            next_id: AtomicU64,
        }

        impl $generator {
            pub const fn new() -> Self {
                Self {
                    next_id: AtomicU64::new(1),
                }
            }

            pub fn next(&self) -> $name {
                $name::new(self.next_id.fetch_add(1, Ordering::SeqCst))
            }

            /// Returns true if `id` was handed out by this generator.
            pub fn issued(&self, id: $name) -> bool {
                id.0 >= 1 && id.0 < self.next_id.load(Ordering::SeqCst)
            }
        }

        impl Default for $generator {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

define_id_type!(
    ConnectionId,
    ConnectionIdGenerator,
    "Process-unique connection ID used in log spans"
);
define_id_type!(
    SavepointId,
    SavepointIdGenerator,
    "Driver-assigned savepoint ID, monotonically increasing per transaction"
);

static CONNECTION_IDS: ConnectionIdGenerator = ConnectionIdGenerator::new();

pub(crate) fn next_connection_id() -> ConnectionId {
    CONNECTION_IDS.next()
}
