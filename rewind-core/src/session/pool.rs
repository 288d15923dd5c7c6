//! Bounded pool of exclusive backend sessions plus the lazily created shared
//! (multiplexed) session.
//!
//! Exclusive slots are semaphore permits: a permit is taken before any
//! session is created or reused, and it is returned when the
//! [`ExclusiveSession`] handle is released or dropped. A failed or cancelled
//! acquisition drops its permit on the way out, so no slot is ever orphaned.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tonic::Code;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendSession};
use crate::error::ConnectionError;

/// What to do when every exclusive session is checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Wait up to `acquire_timeout_ms` for a slot.
    #[default]
    Block,
    /// Fail immediately with `ResourceExhausted`.
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_exclusive_sessions: usize,
    pub min_idle: usize,
    pub acquire_timeout_ms: u64,
    pub exhaustion_policy: ExhaustionPolicy,
    /// Idle sessions older than this are deleted. Zero disables eviction.
    pub idle_ttl_ms: u64,
    pub use_multiplexed: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_exclusive_sessions: 100,
            min_idle: 0,
            acquire_timeout_ms: 30_000,
            exhaustion_policy: ExhaustionPolicy::Block,
            idle_ttl_ms: 300_000,
            use_multiplexed: true,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.max_exclusive_sessions == 0 {
            return Err(ConnectionError::Config(
                "pool.max_exclusive_sessions must be greater than 0".to_string(),
            ));
        }
        if self.min_idle > self.max_exclusive_sessions {
            return Err(ConnectionError::Config(format!(
                "pool.min_idle ({}) must not exceed pool.max_exclusive_sessions ({})",
                self.min_idle, self.max_exclusive_sessions
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub max_exclusive: usize,
    pub in_use: usize,
    pub idle: usize,
    pub sessions_created: u64,
    pub multiplexed: bool,
}

struct IdleSession {
    session: BackendSession,
    last_used: Instant,
}

struct PoolState {
    idle: Vec<IdleSession>,
    sessions_created: u64,
    closed: bool,
}

struct PoolInner {
    backend: Arc<dyn Backend>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    shared: OnceCell<Option<BackendSession>>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn return_session(&self, session: BackendSession) {
        let mut state = self.state();
        if state.closed {
            drop(state);
            self.delete_detached(vec![session]);
            return;
        }
        state.idle.push(IdleSession {
            session,
            last_used: Instant::now(),
        });
    }

    fn evict_locked(&self, state: &mut PoolState) -> Vec<BackendSession> {
        if self.config.idle_ttl_ms == 0 {
            return Vec::new();
        }
        let ttl = Duration::from_millis(self.config.idle_ttl_ms);
        let cutoff = Instant::now().checked_sub(ttl).unwrap_or_else(Instant::now);
        let (keep, expired): (Vec<_>, Vec<_>) = state
            .idle
            .drain(..)
            .partition(|entry| entry.last_used >= cutoff);
        state.idle = keep;
        expired.into_iter().map(|entry| entry.session).collect()
    }

    /// Deletes sessions without blocking the caller. Outside a runtime the
    /// sessions are left for the backend to expire.
    fn delete_detached(&self, sessions: Vec<BackendSession>) {
        if sessions.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                count = sessions.len(),
                "no runtime available to delete sessions"
            );
            return;
        };
        let backend = self.backend.clone();
        handle.spawn(async move {
            for session in sessions {
                if let Err(status) = backend.delete_session(&session).await {
                    warn!(session = %session.name(), error = %status, "failed to delete session");
                }
            }
        });
    }
}

#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Validates the configuration and pre-creates `min_idle` sessions.
    pub async fn connect(
        backend: Arc<dyn Backend>,
        config: PoolConfig,
    ) -> Result<Self, ConnectionError> {
        config.validate()?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_exclusive_sessions)),
                backend,
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    sessions_created: 0,
                    closed: false,
                }),
                shared: OnceCell::new(),
            }),
        };

        for _ in 0..pool.inner.config.min_idle {
            let session = pool.create_exclusive().await?;
            pool.inner.return_session(session);
        }
        info!(
            max_exclusive = pool.inner.config.max_exclusive_sessions,
            min_idle = pool.inner.config.min_idle,
            "session pool ready"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The shared multiplexed session, created on first use. `None` when
    /// multiplexed sessions are disabled or unsupported by the backend.
    pub async fn shared_session(&self) -> Result<Option<BackendSession>, ConnectionError> {
        if !self.inner.config.use_multiplexed {
            return Ok(None);
        }
        let backend = self.inner.backend.clone();
        let shared = self
            .inner
            .shared
            .get_or_try_init(|| async move {
                match backend.create_session(true).await {
                    Ok(session) => {
                        info!(session = %session.name(), "created multiplexed session");
                        Ok(Some(session))
                    }
                    Err(status) if status.code() == Code::Unimplemented => {
                        warn!("multiplexed sessions unsupported, reads will use pooled sessions");
                        Ok(None)
                    }
                    Err(status) => {
                        warn!(error = %status, "failed to create multiplexed session");
                        Err(ConnectionError::from(status))
                    }
                }
            })
            .await?;
        Ok(shared.clone())
    }

    /// Checks out an exclusive session according to the exhaustion policy.
    pub async fn acquire_exclusive(&self) -> Result<ExclusiveSession, ConnectionError> {
        let config = &self.inner.config;
        let semaphore = self.inner.semaphore.clone();
        let permit = match config.exhaustion_policy {
            ExhaustionPolicy::FailFast => semaphore.try_acquire_owned().map_err(|_| {
                ConnectionError::ResourceExhausted(format!(
                    "session pool exhausted (max_exclusive_sessions={})",
                    config.max_exclusive_sessions
                ))
            })?,
            ExhaustionPolicy::Block => {
                let timeout = Duration::from_millis(config.acquire_timeout_ms);
                match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(ConnectionError::ResourceExhausted(
                            "session pool closed while waiting for a session".to_string(),
                        ))
                    }
                    Err(_) => {
                        return Err(ConnectionError::ResourceExhausted(format!(
                            "timed out waiting for a session (max_exclusive_sessions={}, acquire_timeout_ms={})",
                            config.max_exclusive_sessions, config.acquire_timeout_ms
                        )))
                    }
                }
            }
        };

        let (reused, expired) = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(ConnectionError::FailedPrecondition(
                    "session pool is closed".to_string(),
                ));
            }
            let expired = self.inner.evict_locked(&mut state);
            (state.idle.pop().map(|entry| entry.session), expired)
        };
        self.inner.delete_detached(expired);

        let session = match reused {
            Some(session) => session,
            None => self.create_exclusive().await?,
        };
        debug!(session = %session.name(), "checked out exclusive session");
        Ok(ExclusiveSession {
            session,
            pool: self.inner.clone(),
            permit: Some(permit),
        })
    }

    /// Deletes idle sessions that outlived `idle_ttl_ms`. Returns how many
    /// were removed.
    pub async fn evict_idle(&self) -> usize {
        let expired = {
            let mut state = self.inner.state();
            self.inner.evict_locked(&mut state)
        };
        let removed = expired.len();
        for session in expired {
            if let Err(status) = self.inner.backend.delete_session(&session).await {
                warn!(session = %session.name(), error = %status, "failed to delete idle session");
            }
        }
        if removed > 0 {
            debug!(removed, "evicted idle sessions");
        }
        removed
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.inner.state();
        PoolSnapshot {
            max_exclusive: self.inner.config.max_exclusive_sessions,
            in_use: self.inner.config.max_exclusive_sessions
                - self.inner.semaphore.available_permits(),
            idle: state.idle.len(),
            sessions_created: state.sessions_created,
            multiplexed: matches!(self.inner.shared.get(), Some(Some(_))),
        }
    }

    /// Deletes idle and shared sessions. Sessions still checked out are
    /// deleted when their handles are released.
    pub async fn close(&self) {
        let idle: Vec<BackendSession> = {
            let mut state = self.inner.state();
            state.closed = true;
            state.idle.drain(..).map(|entry| entry.session).collect()
        };
        self.inner.semaphore.close();
        for session in idle {
            if let Err(status) = self.inner.backend.delete_session(&session).await {
                warn!(session = %session.name(), error = %status, "failed to delete session");
            }
        }
        if let Some(Some(shared)) = self.inner.shared.get() {
            if let Err(status) = self.inner.backend.delete_session(shared).await {
                warn!(error = %status, "failed to delete multiplexed session");
            }
        }
        info!("session pool closed");
    }

    async fn create_exclusive(&self) -> Result<BackendSession, ConnectionError> {
        let session = self
            .inner
            .backend
            .create_session(false)
            .await
            .map_err(|status| {
                warn!(error = %status, "failed to create session");
                ConnectionError::from(status)
            })?;
        self.inner.state().sessions_created += 1;
        Ok(session)
    }
}

/// An exclusive session checked out of the pool. Releasing is idempotent and
/// also happens on drop.
pub struct ExclusiveSession {
    session: BackendSession,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ExclusiveSession {
    pub fn session(&self) -> &BackendSession {
        &self.session
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }

    pub fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.pool.return_session(self.session.clone());
            drop(permit);
            debug!(session = %self.session.name(), "released exclusive session");
        }
    }
}

impl Drop for ExclusiveSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ExclusiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveSession")
            .field("session", &self.session.name())
            .field("released", &self.is_released())
            .finish()
    }
}
