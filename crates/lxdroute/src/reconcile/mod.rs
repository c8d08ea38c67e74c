//! Reconciliation engine.
//!
//! Each tick reloads the registry, queries the host once per service and
//! publishes a freshly built [`ActiveServerSet`] in one swap. A failing
//! service is skipped and counted against readiness; it never blocks the
//! others. A registry that cannot be loaded aborts the tick and leaves the
//! previous snapshot in place.

pub mod select;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatch::TaskDispatcher;
use crate::registry::{RegistryError, RegistrySource, ServiceDefinition, ServiceKind};
use crate::remote::RemoteError;
use crate::session::{PoolError, SessionId, SessionPool};
use crate::state::{ActiveServerSet, EngineState, LoadBalancerServers, ReadinessState, ServerState};

/// Tick-level failure. The previous snapshot stays published.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to load service registry: {0}")]
    Registry(#[from] RegistryError),
}

/// Why a single service was skipped in a tick.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("tcp service has no port")]
    MissingPort,
    #[error("no session available: {0}")]
    Pool(#[from] PoolError),
    #[error("instance query failed: {0}")]
    Query(#[from] RemoteError),
}

/// Outcome of one completed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub total: usize,
    pub loaded: usize,
    pub elapsed: Duration,
}

type Outcome = (ServiceDefinition, Result<LoadBalancerServers, ServiceError>);

pub struct Reconciler {
    pool: Arc<SessionPool>,
    registry: Arc<dyn RegistrySource>,
    state: Arc<ServerState>,
    dispatcher: Option<Arc<TaskDispatcher>>,
}

impl Reconciler {
    pub fn new(
        pool: Arc<SessionPool>,
        registry: Arc<dyn RegistrySource>,
        state: Arc<ServerState>,
    ) -> Self {
        Self {
            pool,
            registry,
            state,
            dispatcher: None,
        }
    }

    /// Fan services out over `dispatcher` instead of querying them one by one.
    pub fn with_dispatcher(mut self, dispatcher: Arc<TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Run one reconciliation pass and publish its result.
    pub async fn tick(&self) -> Result<TickReport, ReconcileError> {
        let started = Instant::now();
        self.state.set_engine(EngineState::Loading);

        let registry = match self.registry.load().await {
            Ok(registry) => registry,
            Err(e) => {
                self.state.set_engine(EngineState::Idle);
                return Err(e.into());
            }
        };
        for rejected in registry.rejected() {
            tracing::warn!(service = %rejected.key, reason = %rejected.reason, "Skipping invalid service definition");
        }
        let total = registry.declared();
        let services: Vec<ServiceDefinition> = registry.services().cloned().collect();

        let outcomes = match &self.dispatcher {
            Some(dispatcher) => self.reconcile_dispatched(dispatcher, services).await,
            None => self.reconcile_serial(services).await,
        };

        let mut servers = ActiveServerSet::default();
        let mut loaded = 0;
        for (service, outcome) in outcomes {
            match outcome {
                Ok(lb) => {
                    tracing::debug!(
                        service = %service.name,
                        kind = %service.service_type,
                        servers = lb.servers.len(),
                        "Reconciled service"
                    );
                    servers.insert(service.service_type, service.name, lb);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(service = %service.name, error = %e, "Skipping service");
                }
            }
        }

        self.state.publish(servers, ReadinessState::new(total, loaded));
        self.state.set_engine(EngineState::Published);

        let report = TickReport {
            total,
            loaded,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            total = report.total,
            loaded = report.loaded,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Reconciliation tick complete"
        );
        Ok(report)
    }

    async fn reconcile_serial(&self, services: Vec<ServiceDefinition>) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(services.len());
        for service in services {
            let outcome = reconcile_service(&self.pool, &service).await;
            outcomes.push((service, outcome));
        }
        outcomes
    }

    /// Fan services out over the dispatcher, at most one per pool slot at a
    /// time so the fan-out never exhausts the pool on its own.
    async fn reconcile_dispatched(
        &self,
        dispatcher: &TaskDispatcher,
        services: Vec<ServiceDefinition>,
    ) -> Vec<Outcome> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();
        let limit = Arc::new(Semaphore::new(self.pool.config().max_pool_size));
        let mut outcomes = Vec::with_capacity(services.len());
        let mut pending = HashSet::with_capacity(services.len());

        for service in services {
            let pool = Arc::clone(&self.pool);
            let limit = Arc::clone(&limit);
            let tx = tx.clone();
            let task_service = service.clone();
            let submitted = dispatcher.submit(async move {
                let Ok(_permit) = limit.acquire_owned().await else {
                    return;
                };
                let outcome = reconcile_service(&pool, &task_service).await;
                let _ = tx.send((task_service, outcome));
            });
            match submitted {
                Ok(()) => {
                    pending.insert((service.service_type, service.name));
                }
                Err(_) => {
                    tracing::debug!(service = %service.name, "Dispatcher closed, reconciling inline");
                    let outcome = reconcile_service(&self.pool, &service).await;
                    outcomes.push((service, outcome));
                }
            }
        }
        drop(tx);

        // Closes once every task has reported or been dropped.
        while let Some(outcome) = rx.recv().await {
            pending.remove(&(outcome.0.service_type, outcome.0.name.clone()));
            outcomes.push(outcome);
        }
        for (kind, name) in pending {
            tracing::error!(service = %name, kind = %kind, "Service task ended without reporting");
        }
        outcomes
    }

    /// Tick every `every` until `cancel` fires. The first tick runs at once.
    ///
    /// An in-flight tick is never interrupted; cancellation is observed
    /// between ticks.
    pub async fn run(&self, every: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "Reconciliation tick aborted");
            }
            self.state.set_engine(EngineState::Idle);
        }
        tracing::debug!("Reconcile loop stopped");
    }

    pub fn spawn(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(every, cancel).await })
    }
}

/// Query one service's backends through a pooled session.
///
/// The session goes back to the pool whether or not the query succeeded.
pub async fn reconcile_service(
    pool: &SessionPool,
    service: &ServiceDefinition,
) -> Result<LoadBalancerServers, ServiceError> {
    if service.service_type == ServiceKind::Tcp && service.port == 0 {
        return Err(ServiceError::MissingPort);
    }

    let mut session = pool.acquire().await?;
    let slot = BusySlot::new(pool, session.id());
    session.use_project(&service.project_name);
    let listed = session.instances_full(service.instance_type).await;
    slot.disarm();

    if let Err(e) = pool.release(session).await {
        tracing::warn!(service = %service.name, error = %e, "Failed to release session");
    }

    let instances = listed?;
    Ok(LoadBalancerServers {
        servers: select::endpoints(service, &instances),
        options: service.lb_options.clone(),
    })
}

/// Frees a session's busy slot if its holder unwinds before releasing it.
struct BusySlot<'a> {
    pool: &'a SessionPool,
    id: Option<SessionId>,
}

impl<'a> BusySlot<'a> {
    fn new(pool: &'a SessionPool, id: SessionId) -> Self {
        Self { pool, id: Some(id) }
    }

    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for BusySlot<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.pool.discard(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::registry::{LbOptionValue, ServiceRegistry};
    use crate::session::PoolConfig;
    use crate::test_support::{MockHost, instance};

    /// Registry held in memory; `None` simulates an unreadable file.
    struct StaticRegistry(Mutex<Option<String>>);

    impl StaticRegistry {
        fn new(yaml: &str) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Some(yaml.to_string()))))
        }

        fn set(&self, yaml: Option<&str>) {
            *self.0.lock().unwrap() = yaml.map(str::to_string);
        }
    }

    #[async_trait]
    impl RegistrySource for StaticRegistry {
        async fn load(&self) -> Result<ServiceRegistry, RegistryError> {
            let yaml = self.0.lock().unwrap().clone();
            match yaml {
                Some(yaml) => ServiceRegistry::from_yaml(&yaml),
                None => Err(RegistryError::Read {
                    path: "services.yaml".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            }
        }
    }

    const THREE_SERVICES: &str = r#"
services:
  web:
    project_name: shop
    instance_prefix: web-
    lb_options:
      passHostHeader: true
  api:
    project_name: shop
    instance_prefix: api-
    port: 8080
  postgres:
    service_type: tcp
    project_name: data
    instance_prefix: db-
    port: 5432
"#;

    fn host() -> Arc<MockHost> {
        let host = MockHost::new();
        host.set_instances(
            "shop",
            vec![
                instance("web-1", true, &[("inet", "10.0.0.5")]),
                instance("web-2", false, &[("inet", "10.0.0.6")]),
                instance("api-1", true, &[("inet", "10.0.1.5")]),
            ],
        );
        host.set_instances(
            "data",
            vec![instance("db-1", true, &[("inet", "10.0.2.5")])],
        );
        host
    }

    fn pool(host: &Arc<MockHost>) -> Arc<SessionPool> {
        Arc::new(SessionPool::new(
            host.connector(),
            PoolConfig {
                max_pool_size: 4,
                max_idle_sessions: 4,
                ..PoolConfig::default()
            },
        ))
    }

    fn reconciler(host: &Arc<MockHost>, registry: Arc<StaticRegistry>) -> Reconciler {
        Reconciler::new(pool(host), registry, Arc::new(ServerState::new()))
    }

    #[tokio::test]
    async fn tick_publishes_all_services() {
        let host = host();
        let reconciler = reconciler(&host, StaticRegistry::new(THREE_SERVICES));

        let report = reconciler.tick().await.unwrap();
        assert_eq!((report.total, report.loaded), (3, 3));

        let state = reconciler.state();
        assert!(state.is_ready());
        assert_eq!(state.engine(), EngineState::Published);

        let snapshot = state.snapshot();
        let web = &snapshot.servers.http["web"];
        assert_eq!(web.servers, vec!["10.0.0.5"]);
        assert_eq!(
            web.options.get("passHostHeader"),
            Some(&LbOptionValue::Bool(true))
        );
        assert_eq!(
            snapshot.servers.http["api"].servers,
            vec!["http://10.0.1.5:8080"]
        );
        assert_eq!(
            snapshot.servers.tcp["postgres"].servers,
            vec!["10.0.2.5:5432"]
        );
    }

    #[tokio::test]
    async fn failing_service_is_isolated() {
        let host = host();
        host.fail_project("data");
        let reconciler = reconciler(&host, StaticRegistry::new(THREE_SERVICES));

        let report = reconciler.tick().await.unwrap();
        assert_eq!((report.total, report.loaded), (3, 2));

        let readiness = reconciler.state().readiness();
        assert!(!readiness.is_ready());
        assert_eq!(readiness.progress(), "still fetching, loading: 2 / 3");

        let snapshot = reconciler.state().snapshot();
        assert!(snapshot.servers.http.contains_key("web"));
        assert!(snapshot.servers.tcp.is_empty());
    }

    #[tokio::test]
    async fn sessions_are_released_on_query_failure() {
        let host = host();
        host.fail_project("shop");
        host.fail_project("data");
        let reconciler = reconciler(&host, StaticRegistry::new(THREE_SERVICES));

        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.loaded, 0);

        let stats = reconciler.pool.stats();
        assert_eq!(stats.busy, 0);
        assert!(stats.idle >= 1);
        assert_eq!(host.queries(), 3);
    }

    #[tokio::test]
    async fn tcp_without_port_is_skipped() {
        let host = host();
        let registry = StaticRegistry::new(
            "services:\n  postgres:\n    service_type: tcp\n    project_name: data\n    instance_prefix: db-\n",
        );
        let reconciler = reconciler(&host, registry);

        let report = reconciler.tick().await.unwrap();
        assert_eq!((report.total, report.loaded), (1, 0));
        assert!(reconciler.state().snapshot().servers.tcp.is_empty());
        assert_eq!(host.queries(), 0, "no session is used for a skipped service");
    }

    #[tokio::test]
    async fn connect_failure_skips_service() {
        let host = host();
        host.refuse_connections(true);
        let reconciler = reconciler(&host, StaticRegistry::new(THREE_SERVICES));

        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.loaded, 0);
        assert!(!reconciler.state().is_ready());
    }

    #[tokio::test]
    async fn consecutive_ticks_are_idempotent() {
        let host = host();
        let reconciler = reconciler(&host, StaticRegistry::new(THREE_SERVICES));

        reconciler.tick().await.unwrap();
        let first = reconciler.state().snapshot();
        reconciler.tick().await.unwrap();
        let second = reconciler.state().snapshot();

        assert_eq!(first.servers, second.servers);
        assert_eq!(first.readiness.loaded_services, second.readiness.loaded_services);
    }

    #[tokio::test]
    async fn removed_instances_disappear_on_next_tick() {
        let host = host();
        let reconciler = reconciler(&host, StaticRegistry::new(THREE_SERVICES));
        reconciler.tick().await.unwrap();

        host.set_instances("shop", vec![instance("api-1", true, &[("inet", "10.0.1.5")])]);
        reconciler.tick().await.unwrap();

        let snapshot = reconciler.state().snapshot();
        assert!(snapshot.servers.http["web"].servers.is_empty());
        assert!(snapshot.readiness.is_ready());
    }

    #[tokio::test]
    async fn registry_failure_keeps_previous_snapshot() {
        let host = host();
        let registry = StaticRegistry::new(THREE_SERVICES);
        let reconciler = reconciler(&host, Arc::clone(&registry));

        reconciler.tick().await.unwrap();
        let before = reconciler.state().snapshot();

        registry.set(None);
        assert!(matches!(
            reconciler.tick().await,
            Err(ReconcileError::Registry(RegistryError::Read { .. }))
        ));
        assert_eq!(reconciler.state().engine(), EngineState::Idle);

        registry.set(Some("services: [not, a, map]"));
        assert!(reconciler.tick().await.is_err());

        let after = reconciler.state().snapshot();
        assert_eq!(*before, *after);
        assert!(reconciler.state().is_ready());
    }

    #[tokio::test]
    async fn empty_registry_is_never_ready() {
        let host = host();
        let reconciler = reconciler(&host, StaticRegistry::new("services: {}\n"));

        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.total, 0);
        assert!(!reconciler.state().is_ready());
        assert_eq!(reconciler.state().readiness().progress(), "loading config");
    }

    #[tokio::test]
    async fn dispatched_tick_matches_serial_tick() {
        let host = host();
        host.fail_project("data");

        let serial = reconciler(&host, StaticRegistry::new(THREE_SERVICES));
        serial.tick().await.unwrap();

        let dispatcher = Arc::new(TaskDispatcher::new(3));
        let dispatched = reconciler(&host, StaticRegistry::new(THREE_SERVICES))
            .with_dispatcher(Arc::clone(&dispatcher));
        let report = dispatched.tick().await.unwrap();

        assert_eq!((report.total, report.loaded), (3, 2));
        assert_eq!(
            serial.state().snapshot().servers,
            dispatched.state().snapshot().servers
        );
        assert_eq!(dispatched.pool.stats().busy, 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispatched_tick_stays_within_pool_capacity() {
        let host = host().with_connect_delay(Duration::from_millis(20));
        let pool = Arc::new(SessionPool::new(
            host.connector(),
            PoolConfig {
                max_pool_size: 2,
                max_idle_sessions: 2,
                ..PoolConfig::default()
            },
        ));
        let registry = StaticRegistry::new(&format!(
            "{THREE_SERVICES}  admin:\n    project_name: shop\n    instance_prefix: web-\n"
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(4));
        let reconciler = Reconciler::new(Arc::clone(&pool), registry, Arc::new(ServerState::new()))
            .with_dispatcher(Arc::clone(&dispatcher));

        for _ in 0..3 {
            let report = reconciler.tick().await.unwrap();
            assert_eq!((report.total, report.loaded), (4, 4));
            assert!(reconciler.state().is_ready());
        }
        assert!(host.opened() <= 2);
        assert_eq!(pool.stats().busy, 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_service_task_frees_its_session() {
        let host = host();
        host.panic_on_project("broken");
        let registry = StaticRegistry::new(&format!(
            "{THREE_SERVICES}  broken:\n    project_name: broken\n    instance_prefix: x-\n"
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(2));
        let reconciler = reconciler(&host, registry).with_dispatcher(Arc::clone(&dispatcher));

        for _ in 0..2 {
            let report = reconciler.tick().await.unwrap();
            assert_eq!((report.total, report.loaded), (4, 3));
            assert_eq!(reconciler.pool.stats().busy, 0);
        }
        assert!(!reconciler.state().is_ready());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn http_and_tcp_routes_may_share_a_name() {
        let host = host();
        let registry = StaticRegistry::new(
            r#"
services:
  shop-web:
    group_name: shop
    project_name: shop
    instance_prefix: web-
  shop-db:
    service_type: tcp
    group_name: shop
    project_name: data
    instance_prefix: db-
    port: 5432
"#,
        );
        let reconciler = reconciler(&host, registry);

        let report = reconciler.tick().await.unwrap();
        assert_eq!((report.total, report.loaded), (2, 2));

        let snapshot = reconciler.state().snapshot();
        assert_eq!(snapshot.servers.http["shop"].servers, vec!["10.0.0.5"]);
        assert_eq!(snapshot.servers.tcp["shop"].servers, vec!["10.0.2.5:5432"]);
    }

    #[tokio::test]
    async fn invalid_service_counts_against_readiness() {
        let host = host();
        let registry = StaticRegistry::new(
            r#"
services:
  web:
    project_name: shop
    instance_prefix: web-
  sticky:
    project_name: shop
    instance_prefix: api-
    lb_options:
      sticky:
        cookie: lb
"#,
        );
        let reconciler = reconciler(&host, registry);

        let report = reconciler.tick().await.unwrap();
        assert_eq!((report.total, report.loaded), (2, 1));
        assert!(!reconciler.state().is_ready());
        assert!(reconciler.state().snapshot().servers.http.contains_key("web"));
    }

    #[tokio::test]
    async fn closed_dispatcher_falls_back_to_inline() {
        let host = host();
        let dispatcher = Arc::new(TaskDispatcher::new(2));
        dispatcher.shutdown().await;

        let reconciler = reconciler(&host, StaticRegistry::new(THREE_SERVICES))
            .with_dispatcher(dispatcher);
        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.loaded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_cancelled() {
        let host = host();
        let reconciler = Arc::new(reconciler(&host, StaticRegistry::new(THREE_SERVICES)));
        let cancel = CancellationToken::new();

        let handle = Arc::clone(&reconciler).spawn(Duration::from_secs(20), cancel.clone());

        // First tick is immediate.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(reconciler.state().is_ready());
        assert_eq!(reconciler.state().engine(), EngineState::Idle);
        assert_eq!(host.queries(), 3);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(host.queries(), 6);

        cancel.cancel();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(host.queries(), 6);
    }
}
