use crate::options::RequestOptions;
use crate::types::{Mutation, ResultSet, Statement};

/// One successfully executed operation of a read-write transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEntry {
    Query {
        statement: Statement,
        options: RequestOptions,
        checksum: u64,
        row_count: usize,
    },
    Update {
        statement: Statement,
        options: RequestOptions,
        update_count: i64,
    },
    BatchUpdate {
        statements: Vec<Statement>,
        options: RequestOptions,
        update_counts: Vec<i64>,
    },
    /// Buffered writes, sent with the commit.
    Mutations(Vec<Mutation>),
}

impl ReplayEntry {
    pub fn query(statement: Statement, options: &RequestOptions, rows: &ResultSet) -> Self {
        ReplayEntry::Query {
            statement,
            options: options.without_deadline(),
            checksum: rows.checksum(),
            row_count: rows.row_count(),
        }
    }

    pub fn update(statement: Statement, options: &RequestOptions, update_count: i64) -> Self {
        ReplayEntry::Update {
            statement,
            options: options.without_deadline(),
            update_count,
        }
    }

    pub fn batch_update(
        statements: Vec<Statement>,
        options: &RequestOptions,
        update_counts: Vec<i64>,
    ) -> Self {
        ReplayEntry::BatchUpdate {
            statements,
            options: options.without_deadline(),
            update_counts,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, ReplayEntry::Query { .. })
    }

    /// Writes that were already sent to the backend transaction.
    pub fn is_issued_write(&self) -> bool {
        matches!(
            self,
            ReplayEntry::Update { .. } | ReplayEntry::BatchUpdate { .. }
        )
    }

    /// Short label used in logs and listener callbacks.
    pub fn describe(&self) -> String {
        match self {
            ReplayEntry::Query { statement, .. } | ReplayEntry::Update { statement, .. } => {
                statement.sql.clone()
            }
            ReplayEntry::BatchUpdate { statements, .. } => {
                format!("batch of {} statement(s)", statements.len())
            }
            ReplayEntry::Mutations(mutations) => format!("{} mutation(s)", mutations.len()),
        }
    }
}

/// Append-only record of a transaction, truncated by savepoint rollbacks.
#[derive(Debug, Clone, Default)]
pub struct ReplayLog {
    entries: Vec<ReplayEntry>,
}

impl ReplayLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ReplayEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ReplayEntry] {
        &self.entries
    }

    /// Drops every entry at or after `len` and returns them.
    pub fn truncate(&mut self, len: usize) -> Vec<ReplayEntry> {
        if len >= self.entries.len() {
            return Vec::new();
        }
        self.entries.split_off(len)
    }

    pub fn has_writes(&self) -> bool {
        self.entries.iter().any(ReplayEntry::is_write)
    }

    /// All buffered mutations in log order.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                ReplayEntry::Mutations(mutations) => Some(mutations.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
