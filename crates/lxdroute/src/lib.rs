//! lxdroute: reconciles LXD instances into Traefik load-balancer targets.
//!
//! A periodic [`Reconciler`] loads the service registry, queries the LXD host
//! through a bounded [`SessionPool`], and atomically publishes the resulting
//! [`ActiveServerSet`] into [`ServerState`]. The HTTP transport exports that
//! snapshot in the shape Traefik's HTTP provider expects.

mod health;
mod version;

pub mod dispatch;
pub mod export;
pub mod reconcile;
pub mod registry;
pub mod remote;
pub mod session;
pub mod state;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use dispatch::{DispatchError, TaskDispatcher};
pub use health::Health;
pub use reconcile::{ReconcileError, Reconciler, ServiceError, TickReport};
pub use registry::{
    FileRegistry, LbOptionValue, LbOptions, RegistryError, RegistrySource, RejectedService,
    ServiceDefinition, ServiceKind, ServiceRegistry,
};
pub use remote::{Connector, InstanceFull, InstanceServer, InstanceType, RemoteError};
pub use session::{PoolConfig, PoolError, PoolStats, PooledSession, SessionId, SessionPool};
pub use state::{
    ActiveServerSet, EngineState, LoadBalancerServers, ReadinessState, ServerState, Snapshot,
};
pub use version::{LXDROUTE_VERSION, VersionInfo};

pub use tokio_util::sync::CancellationToken;
