//! Replay of an aborted read-write transaction.
//!
//! A retry begins a new backend transaction with the same isolation level and
//! tag, then re-executes the replay log in order. DML sequence numbers restart
//! at 1 for every attempt. Reads and update counts that differ from the
//! original execution are reported to listeners and otherwise accepted.

use tracing::{info, warn};

use super::listener::{ReplayOutcome, RetryResult};
use super::replay::ReplayEntry;
use super::{Transaction, TxContext};
use crate::backend::TransactionSelector;
use crate::batch::interpret_batch_response;
use crate::error::ConnectionError;
use crate::session::SessionHandle;

impl Transaction {
    /// Retries after `abort` until a replay succeeds, a replayed entry fails
    /// with another error, or the attempt budget is spent. In the last case
    /// the first abort of the transaction is returned.
    pub(super) async fn retry(
        &mut self,
        ctx: TxContext<'_>,
        session: &SessionHandle,
        abort: ConnectionError,
    ) -> Result<(), ConnectionError> {
        let original = self.original_abort.get_or_insert(abort).clone();
        loop {
            if self.retry_count >= self.settings.max_attempts {
                warn!(
                    attempts = self.retry_count,
                    max_attempts = self.settings.max_attempts,
                    "transaction aborted too many times"
                );
                let attempt = self.retry_count;
                ctx.listeners.notify(|l| {
                    l.retry_finished(attempt, RetryResult::AbortedAndMaxAttemptsExceeded)
                });
                return Err(original);
            }

            self.retry_count += 1;
            let attempt = self.retry_count;
            info!(attempt, entries = self.log.len(), "retrying aborted transaction");
            ctx.listeners.notify(|l| l.retry_starting(attempt));

            match self.replay(ctx, session, Some(attempt)).await {
                Ok(()) => {
                    self.needs_replay = false;
                    info!(attempt, "transaction replayed");
                    ctx.listeners
                        .notify(|l| l.retry_finished(attempt, RetryResult::Successful));
                    return Ok(());
                }
                Err(err) if err.is_aborted() => {
                    warn!(attempt, error = %err, "replay aborted, restarting");
                    ctx.listeners
                        .notify(|l| l.retry_finished(attempt, RetryResult::AbortedAndRestarting));
                }
                Err(err) => {
                    warn!(attempt, error = %err, "replay failed");
                    ctx.listeners
                        .notify(|l| l.retry_finished(attempt, RetryResult::Error));
                    return Err(err);
                }
            }
        }
    }

    /// Replays the log if a savepoint rollback discarded the backend
    /// transaction. Aborts during that replay go through the normal retry.
    pub(super) async fn ensure_replayed(
        &mut self,
        ctx: TxContext<'_>,
        session: &SessionHandle,
    ) -> Result<(), ConnectionError> {
        if !self.needs_replay {
            return Ok(());
        }
        match self.replay(ctx, session, None).await {
            Ok(()) => {
                self.needs_replay = false;
                Ok(())
            }
            Err(err) if err.is_aborted() && self.retries_enabled() => {
                self.retry(ctx, session, err).await
            }
            Err(err) => Err(err),
        }
    }

    /// Runs the log against a fresh backend transaction. Listener callbacks
    /// are only made for abort retries (`attempt` is set).
    async fn replay(
        &mut self,
        ctx: TxContext<'_>,
        session: &SessionHandle,
        attempt: Option<u32>,
    ) -> Result<(), ConnectionError> {
        self.discard_backend_transaction(ctx, session).await;
        let id = self.ensure_begun(ctx, session).await?;
        let selector = TransactionSelector::Id(id.clone());
        let notify = |f: &dyn Fn(u32)| {
            if let Some(attempt) = attempt {
                f(attempt);
            }
        };

        let entries = self.log.entries().to_vec();
        for (index, entry) in entries.iter().enumerate() {
            let description = entry.describe();
            notify(&|a| {
                ctx.listeners
                    .notify(|l| l.entry_replaying(a, index, &description))
            });

            let outcome = match entry {
                ReplayEntry::Query {
                    statement,
                    options,
                    checksum,
                    ..
                } => ctx
                    .backend
                    .execute_query(session.session(), &selector, statement, options)
                    .await
                    .map_err(ConnectionError::from)
                    .map(|rows| changed(rows.checksum() != *checksum)),
                ReplayEntry::Update {
                    statement,
                    options,
                    update_count,
                } => {
                    self.seqno += 1;
                    ctx.backend
                        .execute_dml(session.session(), &id, statement, self.seqno, options)
                        .await
                        .map_err(ConnectionError::from)
                        .map(|count| changed(count != *update_count))
                }
                ReplayEntry::BatchUpdate {
                    statements,
                    options,
                    update_counts,
                } => {
                    self.seqno += 1;
                    match ctx
                        .backend
                        .execute_batch_dml(session.session(), &id, statements, self.seqno, options)
                        .await
                    {
                        Ok(response) => interpret_batch_response(response)
                            .map(|counts| changed(counts != *update_counts)),
                        Err(status) => Err(ConnectionError::from(status)),
                    }
                }
                ReplayEntry::Mutations(_) => Ok(ReplayOutcome::Unchanged),
            };

            match outcome {
                Ok(outcome) => {
                    if outcome == ReplayOutcome::ResultChanged {
                        warn!(index, entry = %description, "replayed entry observed different results");
                    }
                    notify(&|a| ctx.listeners.notify(|l| l.entry_replayed(a, index, outcome)));
                }
                Err(err) => {
                    notify(&|a| ctx.listeners.notify(|l| l.entry_failed(a, index, &err)));
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

fn changed(differs: bool) -> ReplayOutcome {
    if differs {
        ReplayOutcome::ResultChanged
    } else {
        ReplayOutcome::Unchanged
    }
}
