//! Declarative service registry.
//!
//! The registry file maps a service name to the rule that selects its
//! backends:
//!
//! ```yaml
//! services:
//!   shop-web:
//!     service_type: http
//!     group_name: shop
//!     project_name: shop
//!     instance_prefix: web-
//!     instance_type: container
//!     port: 8080
//!     lb_options:
//!       passHostHeader: true
//! ```
//!
//! The registry is reloaded from scratch on every tick and never merged.
//! Routes are unique per kind: an http and a tcp service may share a name.
//! An entry that does not parse is rejected on its own and the rest of the
//! file still loads.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::remote::InstanceType;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse service registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("services {first} and {second} both publish {kind} route {route}")]
    DuplicateRoute {
        kind: ServiceKind,
        route: String,
        first: String,
        second: String,
    },
}

/// Route kind; selects the Traefik section a service is exported under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    Http,
    Tcp,
}

impl From<Option<String>> for ServiceKind {
    fn from(value: Option<String>) -> Self {
        match value.as_deref().map(str::trim) {
            Some(kind) if kind.eq_ignore_ascii_case("tcp") => Self::Tcp,
            _ => Self::Http,
        }
    }
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A load-balancer option value, passed through to the proxy verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LbOptionValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<LbOptionValue>),
}

/// Ordered option bag.
pub type LbOptions = IndexMap<String, LbOptionValue>;

/// One routed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Published route name: `group_name`, or the registry key when empty.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub service_type: ServiceKind,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub instance_prefix: String,
    #[serde(default)]
    pub instance_type: InstanceType,
    /// Zero means unset.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub lb_options: LbOptions,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    services: IndexMap<String, serde_yaml::Value>,
}

/// A registry entry that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedService {
    /// Registry key of the entry.
    pub key: String,
    pub reason: String,
}

/// (kind, route name) → definition, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceRegistry {
    services: IndexMap<(ServiceKind, String), ServiceDefinition>,
    rejected: Vec<RejectedService>,
}

impl ServiceRegistry {
    pub fn from_yaml(source: &str) -> Result<Self, RegistryError> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: RegistryFile = serde_yaml::from_str(source)?;

        let mut entries = Vec::with_capacity(file.services.len());
        let mut rejected = Vec::new();
        for (key, value) in file.services {
            match serde_yaml::from_value::<ServiceDefinition>(value) {
                Ok(definition) => entries.push((key, definition)),
                Err(e) => rejected.push(RejectedService {
                    key,
                    reason: e.to_string(),
                }),
            }
        }

        let mut registry = Self::from_entries(entries)?;
        registry.rejected = rejected;
        Ok(registry)
    }

    /// Build from registry-key → definition entries, resolving route names.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, ServiceDefinition)>,
    ) -> Result<Self, RegistryError> {
        let mut services: IndexMap<(ServiceKind, String), ServiceDefinition> = IndexMap::new();
        let mut owners: IndexMap<(ServiceKind, String), String> = IndexMap::new();

        for (key, mut definition) in entries {
            let route = if definition.group_name.trim().is_empty() {
                key.clone()
            } else {
                definition.group_name.trim().to_string()
            };
            let slot = (definition.service_type, route);

            if let Some(first) = owners.get(&slot) {
                let (kind, route) = slot;
                return Err(RegistryError::DuplicateRoute {
                    kind,
                    route,
                    first: first.clone(),
                    second: key,
                });
            }

            definition.name = slot.1.clone();
            owners.insert(slot.clone(), key);
            services.insert(slot, definition);
        }

        Ok(Self {
            services,
            rejected: Vec::new(),
        })
    }

    /// Number of routable services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Entries in the file, including rejected ones.
    pub fn declared(&self) -> usize {
        self.services.len() + self.rejected.len()
    }

    pub fn get(&self, kind: ServiceKind, route: &str) -> Option<&ServiceDefinition> {
        self.services.get(&(kind, route.to_string()))
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.services.values()
    }

    pub fn rejected(&self) -> &[RejectedService] {
        &self.rejected
    }
}

/// Where the registry comes from on each tick.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn load(&self) -> Result<ServiceRegistry, RegistryError>;
}

/// Registry read from a YAML file on every load.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RegistrySource for FileRegistry {
    async fn load(&self) -> Result<ServiceRegistry, RegistryError> {
        let source =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| RegistryError::Read {
                    path: self.path.clone(),
                    source,
                })?;
        ServiceRegistry::from_yaml(&source)
    }
}
