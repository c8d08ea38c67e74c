//! Session pool implementation.
//!
//! All mutations of the idle/busy collections happen under one mutex and never
//! across an await point. Remote work (connect, close) runs outside the lock;
//! a connect in flight holds a reservation so the capacity bound also covers
//! sessions that are still being opened.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::pooled::{PooledSession, SessionId};
use crate::remote::{Connector, RemoteError};

const DEFAULT_MAX_POOL_SIZE: usize = 5;
const DEFAULT_MAX_IDLE_SESSIONS: usize = 3;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity configuration. Zero values fall back to defaults.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub max_idle_sessions: usize,
    pub idle_timeout: Duration,
    /// Sessions opened at construction. Defaults to `max_idle_sessions`.
    pub prewarm: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_idle_sessions: DEFAULT_MAX_IDLE_SESSIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            prewarm: None,
        }
    }
}

impl PoolConfig {
    fn normalized(mut self) -> Self {
        if self.max_pool_size == 0 {
            self.max_pool_size = DEFAULT_MAX_POOL_SIZE;
        }
        if self.max_idle_sessions == 0 {
            self.max_idle_sessions = DEFAULT_MAX_IDLE_SESSIONS;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        self
    }

    fn prewarm_count(&self) -> usize {
        self.prewarm
            .unwrap_or(self.max_idle_sessions)
            .min(self.max_pool_size)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("session pool exhausted ({max} sessions open)")]
    Exhausted { max: usize },
    #[error("failed to open session: {0}")]
    Open(#[from] RemoteError),
    #[error("session {0} is not checked out from this pool")]
    NotBusy(SessionId),
    #[error("session pool is closed")]
    Closed,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub opening: usize,
    pub max_pool_size: usize,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.idle + self.busy + self.opening
    }
}

struct PoolState {
    /// Oldest release at the front, most recent at the back.
    idle: VecDeque<PooledSession>,
    /// Checked-out session ids with their acquire time.
    busy: HashMap<SessionId, Instant>,
    /// Connects in flight, counted against capacity.
    opening: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.busy.len() + self.opening
    }
}

/// Releases a capacity reservation when a connect finishes or is abandoned.
struct OpeningReservation<'a> {
    pool: &'a SessionPool,
}

impl Drop for OpeningReservation<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.opening = state.opening.saturating_sub(1);
    }
}

/// Bounded pool of sessions to the host.
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: StdMutex<PoolState>,
}

impl SessionPool {
    /// Create an empty pool. Sessions are opened on demand.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let config = config.normalized();
        Self {
            connector,
            state: StdMutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_pool_size),
                busy: HashMap::with_capacity(config.max_pool_size),
                opening: 0,
                closed: false,
            }),
            config,
        }
    }

    /// Create a pool and pre-warm it.
    ///
    /// Individual pre-warm failures are logged. If every pre-warm connect
    /// fails the first error is returned: the host is unreachable or the
    /// credentials are rejected.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, PoolError> {
        let pool = Arc::new(Self::new(connector, config));
        let wanted = pool.config.prewarm_count();

        let mut opened = 0;
        let mut first_error = None;
        for _ in 0..wanted {
            match pool.connector.connect().await {
                Ok(server) => {
                    pool.lock().idle.push_back(PooledSession::new(server));
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to pre-warm session");
                    first_error.get_or_insert(e);
                }
            }
        }

        if opened == 0
            && let Some(e) = first_error
        {
            return Err(PoolError::Open(e));
        }

        tracing::info!(
            opened,
            max_pool_size = pool.config.max_pool_size,
            "Session pool ready"
        );
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Session pool mutex poisoned - recovering state");
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.idle.len(),
            busy: state.busy.len(),
            opening: state.opening,
            max_pool_size: self.config.max_pool_size,
        }
    }

    /// Check out a session.
    ///
    /// Returns the most recently released idle session, or opens a new one
    /// while under capacity. At capacity with nothing idle this fails with
    /// [`PoolError::Exhausted`] immediately rather than waiting.
    pub async fn acquire(&self) -> Result<PooledSession, PoolError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(mut session) = state.idle.pop_back() {
                state.busy.insert(session.id(), Instant::now());
                session.check_out();
                return Ok(session);
            }
            if state.total() >= self.config.max_pool_size {
                return Err(PoolError::Exhausted {
                    max: self.config.max_pool_size,
                });
            }
            state.opening += 1;
        }

        let reservation = OpeningReservation { pool: self };
        let server = self.connector.connect().await?;
        let mut session = PooledSession::new(server);

        let admitted = {
            let mut state = self.lock();
            if state.closed {
                false
            } else {
                state.busy.insert(session.id(), Instant::now());
                true
            }
        };
        drop(reservation);

        if !admitted {
            session.close().await;
            return Err(PoolError::Closed);
        }

        tracing::debug!(session = %session.id(), "Opened new pooled session");
        session.check_out();
        Ok(session)
    }

    /// Return a checked-out session to the idle set.
    ///
    /// A session this pool does not track as busy is closed and reported as
    /// [`PoolError::NotBusy`]. After [`close`](Self::close) released
    /// sessions are closed instead of kept.
    pub async fn release(&self, mut session: PooledSession) -> Result<(), PoolError> {
        session.check_in();
        let id = session.id();

        let rejected = {
            let mut state = self.lock();
            if state.busy.remove(&id).is_none() {
                Some((session, Err(PoolError::NotBusy(id))))
            } else if state.closed {
                Some((session, Ok(())))
            } else {
                state.idle.push_back(session);
                None
            }
        };

        match rejected {
            Some((session, result)) => {
                if let Err(e) = &result {
                    tracing::error!(session = %id, error = %e, "Rejected session release");
                }
                session.close().await;
                result
            }
            None => Ok(()),
        }
    }

    /// Free the busy slot of a session that will never be released.
    ///
    /// For unwinding paths that cannot await [`release`](Self::release). The
    /// owner drops the handle itself, without a remote close.
    pub fn discard(&self, id: SessionId) {
        if self.lock().busy.remove(&id).is_some() {
            tracing::warn!(session = %id, "Discarded checked-out session");
        }
    }

    /// Evict idle sessions past `idle_timeout`, then trim the idle set down
    /// to `max_idle_sessions` oldest-first. Every evicted session is closed.
    ///
    /// Returns the number of sessions closed.
    pub async fn reap(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<PooledSession> = {
            let mut state = self.lock();
            let mut evicted = Vec::new();

            let mut kept = VecDeque::with_capacity(state.idle.len());
            for session in state.idle.drain(..) {
                if session.idle_for(now) > self.config.idle_timeout {
                    evicted.push(session);
                } else {
                    kept.push_back(session);
                }
            }
            state.idle = kept;

            while state.idle.len() > self.config.max_idle_sessions {
                if let Some(session) = state.idle.pop_front() {
                    evicted.push(session);
                }
            }
            evicted
        };

        let count = evicted.len();
        for session in evicted {
            session.close().await;
        }
        count
    }

    /// Run [`reap`](Self::reap) every `every` until cancelled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing is stale yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.reap().await;
                        if evicted > 0 {
                            tracing::debug!(evicted, stats = ?pool.stats(), "Reaped idle sessions");
                        }
                    }
                }
            }
            tracing::debug!("Session reaper stopped");
        })
    }

    /// Close every idle session and refuse further acquires.
    pub async fn close(&self) {
        let idle: Vec<PooledSession> = {
            let mut state = self.lock();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        let count = idle.len();
        for session in idle {
            session.close().await;
        }
        tracing::info!(closed = count, "Session pool closed");
    }
}
