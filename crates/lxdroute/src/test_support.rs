//! In-memory host double shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::remote::{
    Connector, InstanceAddress, InstanceFull, InstanceServer, InstanceState, InstanceType,
    NetworkInterface, RemoteError,
};

/// Fake virtualization host: per-project instance lists plus open/close accounting.
#[derive(Default)]
pub(crate) struct MockHost {
    projects: Mutex<HashMap<String, Vec<InstanceFull>>>,
    failing_projects: Mutex<HashSet<String>>,
    panicking_projects: Mutex<HashSet<String>>,
    refuse: AtomicBool,
    connect_delay: Mutex<Duration>,
    opened: AtomicUsize,
    queries: AtomicUsize,
    closes: Mutex<HashMap<usize, usize>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_connect_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.connect_delay.lock().unwrap() = delay;
        self
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            host: Arc::clone(self),
        })
    }

    pub fn set_instances(&self, project: &str, instances: Vec<InstanceFull>) {
        self.projects
            .lock()
            .unwrap()
            .insert(project.to_string(), instances);
    }

    pub fn fail_project(&self, project: &str) {
        self.failing_projects
            .lock()
            .unwrap()
            .insert(project.to_string());
    }

    pub fn panic_on_project(&self, project: &str) {
        self.panicking_projects
            .lock()
            .unwrap()
            .insert(project.to_string());
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn closed_total(&self) -> usize {
        self.closes.lock().unwrap().values().sum()
    }

    pub fn closed_at_most_once(&self) -> bool {
        self.closes.lock().unwrap().values().all(|&n| n <= 1)
    }
}

struct MockConnector {
    host: Arc<MockHost>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn InstanceServer>, RemoteError> {
        let delay = *self.host.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.host.refuse.load(Ordering::SeqCst) {
            return Err(RemoteError::Connect {
                url: "mock://host".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let serial = self.host.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            host: Arc::clone(&self.host),
            serial,
            project: String::new(),
        }))
    }
}

struct MockSession {
    host: Arc<MockHost>,
    serial: usize,
    project: String,
}

#[async_trait]
impl InstanceServer for MockSession {
    fn use_project(&mut self, project: &str) {
        self.project = project.to_string();
    }

    async fn instances_full(
        &self,
        _instance_type: InstanceType,
    ) -> Result<Vec<InstanceFull>, RemoteError> {
        self.host.queries.fetch_add(1, Ordering::SeqCst);
        let panics = self
            .host
            .panicking_projects
            .lock()
            .unwrap()
            .contains(&self.project);
        if panics {
            panic!("instance listing for {} blew up", self.project);
        }
        if self
            .host
            .failing_projects
            .lock()
            .unwrap()
            .contains(&self.project)
        {
            return Err(RemoteError::Status {
                status: 500,
                message: format!("project {} unavailable", self.project),
            });
        }
        Ok(self
            .host
            .projects
            .lock()
            .unwrap()
            .get(&self.project)
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&mut self) {
        *self
            .host
            .closes
            .lock()
            .unwrap()
            .entry(self.serial)
            .or_insert(0) += 1;
    }
}

/// Build an instance with the given addresses on `eth0`.
pub(crate) fn instance(name: &str, active: bool, addresses: &[(&str, &str)]) -> InstanceFull {
    let eth0 = NetworkInterface {
        addresses: addresses
            .iter()
            .map(|(family, address)| InstanceAddress {
                family: family.to_string(),
                address: address.to_string(),
            })
            .collect(),
    };
    InstanceFull {
        name: name.to_string(),
        status: if active { "Running" } else { "Stopped" }.to_string(),
        status_code: Some(if active { 103 } else { 102 }),
        state: Some(InstanceState {
            network: Some(HashMap::from([("eth0".to_string(), eth0)])),
        }),
    }
}
