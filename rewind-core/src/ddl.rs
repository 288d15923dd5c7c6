//! Schema changes as long-running admin operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::backend::Backend;
use crate::error::{ConnectionError, TimeoutOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdlConfig {
    pub poll_interval_ms: u64,
    /// How long to wait for an operation before giving up. Zero waits forever.
    pub timeout_ms: u64,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            timeout_ms: 600_000,
        }
    }
}

/// Submits `statements` as one operation and polls until it finishes.
#[instrument(skip(backend, statements), fields(statements = statements.len()))]
pub async fn run_ddl(
    backend: &dyn Backend,
    statements: &[String],
    config: &DdlConfig,
) -> Result<(), ConnectionError> {
    if statements.is_empty() {
        return Ok(());
    }
    let started = Instant::now();
    let deadline = (config.timeout_ms > 0)
        .then(|| started + Duration::from_millis(config.timeout_ms));
    let mut operation = backend.update_ddl(statements).await?;

    while !operation.done {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(ConnectionError::timeout(
                    TimeoutOutcome::Unknown,
                    format!(
                        "schema operation {} did not finish within {}ms",
                        operation.name, config.timeout_ms
                    ),
                ));
            }
        }
        tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
        operation = backend.get_operation(&operation.name).await?;
        debug!(operation = %operation.name, done = operation.done, "polled schema operation");
    }

    if let Some(status) = operation.error {
        return Err(status.into());
    }
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "schema operation finished"
    );
    Ok(())
}
