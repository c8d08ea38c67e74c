//! PooledSession - a remote handle plus the bookkeeping the pool needs.

use tokio::time::Instant;

use crate::remote::{InstanceFull, InstanceServer, InstanceType, RemoteError};

/// Opaque session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pooled session.
///
/// Callers receive it from `SessionPool::acquire` and must hand it back with
/// `SessionPool::release`; dropping a checked-out session leaks its slot.
pub struct PooledSession {
    id: SessionId,
    server: Box<dyn InstanceServer>,
    last_used: Instant,
    checked_out: bool,
}

impl PooledSession {
    pub(crate) fn new(server: Box<dyn InstanceServer>) -> Self {
        Self {
            id: SessionId::new(),
            server,
            last_used: Instant::now(),
            checked_out: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Scope the session to a project.
    pub fn use_project(&mut self, project: &str) {
        self.server.use_project(project);
    }

    pub async fn instances_full(
        &self,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceFull>, RemoteError> {
        self.server.instances_full(instance_type).await
    }

    pub(crate) fn check_out(&mut self) {
        self.checked_out = true;
    }

    pub(crate) fn check_in(&mut self) {
        self.checked_out = false;
        self.last_used = Instant::now();
    }

    pub(crate) fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_used)
    }

    /// Close the remote side. Consumes the session so it runs once.
    pub(crate) async fn close(mut self) {
        self.checked_out = false;
        self.server.close().await;
        tracing::debug!(session = %self.id, "Session closed");
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if self.checked_out {
            tracing::error!(session = %self.id, "PooledSession dropped without release");
        }
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("last_used", &self.last_used)
            .field("checked_out", &self.checked_out)
            .finish()
    }
}
