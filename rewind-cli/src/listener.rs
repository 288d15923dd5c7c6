use rewind_core::{ConnectionError, ReplayOutcome, RetryListener, RetryResult};
use tracing::{info, warn};

/// Logs transparent retries so they are visible in the shell.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl RetryListener for LoggingListener {
    fn retry_starting(&self, attempt: u32) {
        info!(attempt, "transaction aborted, replaying");
    }

    fn entry_replayed(&self, attempt: u32, index: usize, outcome: ReplayOutcome) {
        if outcome == ReplayOutcome::ResultChanged {
            warn!(attempt, index, "replayed statement returned different results");
        }
    }

    fn entry_failed(&self, attempt: u32, index: usize, error: &ConnectionError) {
        warn!(attempt, index, %error, "replayed statement failed");
    }

    fn retry_finished(&self, attempt: u32, result: RetryResult) {
        info!(attempt, ?result, "retry finished");
    }
}
