//! Bounded pool of reusable sessions to the virtualization host.
//!
//! A session is either idle (owned by the pool) or busy (owned by the caller
//! between `acquire` and `release`). The pool tracks busy sessions by id so a
//! release of a session it never handed out is reported instead of silently
//! corrupting the accounting.

mod pool;
mod pooled;

pub use pool::{PoolConfig, PoolError, PoolStats, SessionPool};
pub use pooled::{PooledSession, SessionId};
