//! Fixed-size pool of engine sessions with exclusive, scoped leases.
//!
//! Idle sessions sit in a vector guarded by a short-lived mutex; a semaphore
//! holds one permit per idle session so waiters suspend without polling.
//! A [`SessionLease`] hands its session back when dropped: healthy sessions
//! return to the idle set, interrupted ones are recovered first, and dead
//! ones are replaced in the background.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::jobs::RetryPolicy;
use crate::session::{EngineOptions, EngineSession, SessionState};

/// Starts engine processes. The returned session is connected but has not
/// completed the handshake.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, id: usize, options: &EngineOptions) -> Result<EngineSession, WorkerError>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub acquire_timeout: Duration,
    /// Delay schedule between failed replacement launches. Replacement keeps
    /// trying until it succeeds or the pool shuts down.
    pub replace_backoff: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 1,
            acquire_timeout: Duration::from_secs(30),
            replace_backoff: RetryPolicy {
                max_attempts: u32::MAX,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(10),
                multiplier: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
    pub replacing: usize,
}

struct PoolInner {
    launcher: Arc<dyn EngineLauncher>,
    options: EngineOptions,
    config: PoolConfig,
    idle: Mutex<Vec<EngineSession>>,
    available: Semaphore,
    next_id: AtomicUsize,
    leased: AtomicUsize,
    replacing: AtomicUsize,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

impl EnginePool {
    /// Launch and initialize every session. Fails if any session fails to start.
    pub async fn start(
        launcher: Arc<dyn EngineLauncher>,
        options: EngineOptions,
        config: PoolConfig,
    ) -> Result<Self, WorkerError> {
        if config.size == 0 {
            return Err(WorkerError::Config("engine pool size must be at least 1".into()));
        }

        let inner = Arc::new(PoolInner {
            launcher,
            options,
            idle: Mutex::new(Vec::with_capacity(config.size)),
            available: Semaphore::new(0),
            next_id: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            replacing: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            config,
        });

        let launches = (0..inner.config.size).map(|_| inner.spawn_session());
        for session in try_join_all(launches).await? {
            inner.return_idle(session);
        }

        info!(size = inner.config.size, "Engine pool started");
        Ok(Self { inner })
    }

    /// Wait for a free session, up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<SessionLease, WorkerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(WorkerError::PoolClosed);
        }

        let limit = self.inner.config.acquire_timeout;
        let permit = tokio::time::timeout(limit, self.inner.available.acquire())
            .await
            .map_err(|_| WorkerError::AcquireTimeout(limit))?
            .map_err(|_| WorkerError::PoolClosed)?;
        permit.forget();

        let session = self.inner.idle.lock().pop().ok_or(WorkerError::PoolClosed)?;
        self.inner.leased.fetch_add(1, Ordering::AcqRel);
        debug!(session_id = session.id(), "Session leased");

        Ok(SessionLease {
            session: Some(session),
            pool: self.inner.clone(),
        })
    }

    /// [`acquire`](Self::acquire), abandoned with `Cancelled` if `cancel` fires first.
    pub async fn acquire_with(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<SessionLease, WorkerError> {
        match cancel {
            Some(token) => tokio::select! {
                lease = self.acquire() => lease,
                _ = token.cancelled() => Err(WorkerError::Cancelled),
            },
            None => self.acquire().await,
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.inner.config.size,
            idle: self.inner.idle.lock().len(),
            leased: self.inner.leased.load(Ordering::Acquire),
            replacing: self.inner.replacing.load(Ordering::Acquire),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shut down every idle session. Leased sessions are shut down when
    /// their lease is dropped. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.available.close();

        let sessions = std::mem::take(&mut *self.inner.idle.lock());
        let count = sessions.len();
        join_all(sessions.into_iter().map(|mut session| async move {
            session.shutdown().await;
        }))
        .await;

        info!(stopped = count, "Engine pool shut down");
    }
}

impl PoolInner {
    async fn spawn_session(&self) -> Result<EngineSession, WorkerError> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let mut session = self.launcher.launch(id, &self.options).await?;
        session.initialize().await?;
        Ok(session)
    }

    fn return_idle(&self, session: EngineSession) {
        {
            let mut idle = self.idle.lock();
            if !self.closed.load(Ordering::Acquire) {
                idle.push(session);
                drop(idle);
                self.available.add_permits(1);
                return;
            }
        }
        retire(session);
    }

    fn release(self: &Arc<Self>, session: EngineSession) {
        if self.closed.load(Ordering::Acquire) {
            retire(session);
            return;
        }

        match session.state() {
            SessionState::Idle => self.return_idle(session),
            SessionState::Dead => {
                drop(session);
                self.schedule_replacement();
            }
            _ => self.schedule_recovery(session),
        }
    }

    fn schedule_recovery(self: &Arc<Self>, mut session: EngineSession) {
        let Ok(handle) = Handle::try_current() else {
            warn!(session_id = session.id(), "No runtime to recover session, dropping it");
            return;
        };

        let pool = self.clone();
        handle.spawn(async move {
            let session_id = session.id();
            match session.recover().await {
                Ok(()) => {
                    debug!(session_id, "Session recovered");
                    pool.return_idle(session);
                }
                Err(e) => {
                    warn!(session_id, error = %e, "Session recovery failed, replacing");
                    session.shutdown().await;
                    pool.schedule_replacement();
                }
            }
        });
    }

    fn schedule_replacement(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            warn!("No runtime to replace dead session, pool capacity reduced");
            return;
        };

        self.replacing.fetch_add(1, Ordering::AcqRel);
        let pool = self.clone();
        handle.spawn(async move {
            let mut attempt = 0;
            while !pool.closed.load(Ordering::Acquire) {
                match pool.spawn_session().await {
                    Ok(session) => {
                        info!(session_id = session.id(), attempt, "Engine session replaced");
                        pool.return_idle(session);
                        break;
                    }
                    Err(e) => {
                        let delay = pool.config.replace_backoff.backoff_delay(attempt);
                        warn!(attempt, error = %e, ?delay, "Engine replacement failed");
                        tokio::time::sleep(delay).await;
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
            pool.replacing.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

/// Shut a session down off the caller's path, or kill it on drop when no
/// runtime is available.
fn retire(mut session: EngineSession) {
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(async move { session.shutdown().await });
    }
}

/// Exclusive access to one pooled session, released on drop.
pub struct SessionLease {
    session: Option<EngineSession>,
    pool: Arc<PoolInner>,
}

impl Deref for SessionLease {
    type Target = EngineSession;

    fn deref(&self) -> &EngineSession {
        self.session.as_ref().expect("lease holds a session until dropped")
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut EngineSession {
        self.session.as_mut().expect("lease holds a session until dropped")
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.leased.fetch_sub(1, Ordering::AcqRel);
            debug!(session_id = session.id(), state = ?session.state(), "Session released");
            self.pool.release(session);
        }
    }
}
