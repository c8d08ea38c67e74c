//! Published reconciliation state.
//!
//! The reconciler is the only writer. It builds a complete [`Snapshot`] off to
//! the side and swaps it in with one pointer store, so readers either see the
//! previous pass or the new one, never a mix. Readers take no lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::registry::{LbOptions, ServiceKind};

/// Endpoints and pass-through options for one route.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadBalancerServers {
    pub servers: Vec<String>,
    pub options: LbOptions,
}

/// Route tables keyed by kind, then by route name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActiveServerSet {
    pub http: BTreeMap<String, LoadBalancerServers>,
    pub tcp: BTreeMap<String, LoadBalancerServers>,
}

impl ActiveServerSet {
    pub fn insert(&mut self, kind: ServiceKind, name: String, servers: LoadBalancerServers) {
        match kind {
            ServiceKind::Http => self.http.insert(name, servers),
            ServiceKind::Tcp => self.tcp.insert(name, servers),
        };
    }

    pub fn routes(&self, kind: ServiceKind) -> &BTreeMap<String, LoadBalancerServers> {
        match kind {
            ServiceKind::Http => &self.http,
            ServiceKind::Tcp => &self.tcp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_empty() && self.tcp.is_empty()
    }
}

/// How much of the registry the latest pass covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessState {
    pub total_services: usize,
    pub loaded_services: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReadinessState {
    pub fn new(total_services: usize, loaded_services: usize) -> Self {
        Self {
            total_services,
            loaded_services,
            completed_at: Some(Utc::now()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.total_services > 0 && self.loaded_services == self.total_services
    }

    /// Human-readable loading progress for not-ready responses.
    pub fn progress(&self) -> String {
        if self.total_services == 0 {
            "loading config".to_string()
        } else {
            format!(
                "still fetching, loading: {} / {}",
                self.loaded_services, self.total_services
            )
        }
    }
}

/// One reconciliation pass: routes and readiness from the same tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub servers: ActiveServerSet,
    pub readiness: ReadinessState,
}

/// Reconciliation engine phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    /// Waiting for the next tick.
    #[default]
    Idle,
    /// Registry load and instance queries in flight.
    Loading,
    /// A new snapshot has just been published.
    Published,
}

/// Shared, read-optimized view of the latest published pass.
pub struct ServerState {
    current: ArcSwap<Snapshot>,
    engine: watch::Sender<EngineState>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    pub fn new() -> Self {
        let (engine, _) = watch::channel(EngineState::Idle);
        Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
            engine,
        }
    }

    /// Replace the visible snapshot wholesale.
    pub fn publish(&self, servers: ActiveServerSet, readiness: ReadinessState) {
        self.current.store(Arc::new(Snapshot { servers, readiness }));
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn readiness(&self) -> ReadinessState {
        self.current.load().readiness
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().readiness.is_ready()
    }

    pub fn engine(&self) -> EngineState {
        *self.engine.borrow()
    }

    pub fn set_engine(&self, state: EngineState) {
        self.engine.send_replace(state);
    }

    pub fn subscribe_engine(&self) -> watch::Receiver<EngineState> {
        self.engine.subscribe()
    }
}
