//! Remote API seam for the virtualization host.
//!
//! The session pool only needs two capabilities from the host: opening a new
//! authenticated handle ([`Connector`]) and, per handle, listing full instance
//! details within a project ([`InstanceServer`]). The LXD REST implementation
//! lives in [`lxd`]; tests substitute in-memory doubles.

pub mod lxd;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use lxd::{Credentials, LxdConnector};

/// LXD status code for a stopped instance.
pub const STATUS_CODE_STOPPED: u16 = 102;
/// LXD status code for an instance in error state.
pub const STATUS_CODE_ERROR: u16 = 400;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("invalid client credentials: {0}")]
    InvalidCredentials(String),
    #[error("session is closed")]
    Closed,
}

/// Instance type filter for instance listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", rename_all = "kebab-case")]
pub enum InstanceType {
    /// No filter: containers and virtual machines.
    #[default]
    Any,
    Container,
    VirtualMachine,
}

impl InstanceType {
    /// Value of the `instance-type` query parameter, if any.
    pub fn as_query(&self) -> Option<&'static str> {
        match self {
            Self::Any => None,
            Self::Container => Some("container"),
            Self::VirtualMachine => Some("virtual-machine"),
        }
    }
}

impl From<Option<String>> for InstanceType {
    fn from(value: Option<String>) -> Self {
        match value.as_deref().map(str::trim) {
            None | Some("") => Self::Any,
            Some("container") => Self::Container,
            Some("virtual-machine") => Self::VirtualMachine,
            Some(other) => {
                tracing::warn!(instance_type = %other, "Unrecognized instance type, listing all instances");
                Self::Any
            }
        }
    }
}

/// One address on a network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub family: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(default)]
    pub addresses: Vec<InstanceAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub network: Option<HashMap<String, NetworkInterface>>,
}

/// Full instance details as returned by a recursive instance listing.
///
/// Only the fields the reconciler reads are kept; everything else in the
/// remote payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFull {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub state: Option<InstanceState>,
}

impl InstanceFull {
    /// Whether the host reports the instance as running.
    pub fn is_active(&self) -> bool {
        match self.status_code {
            Some(STATUS_CODE_STOPPED) | Some(STATUS_CODE_ERROR) => false,
            Some(_) => true,
            None => {
                !(self.status.eq_ignore_ascii_case("stopped")
                    || self.status.eq_ignore_ascii_case("error"))
            }
        }
    }

    pub fn interface(&self, name: &str) -> Option<&NetworkInterface> {
        self.state.as_ref()?.network.as_ref()?.get(name)
    }
}

/// A live, authenticated handle to the host's API.
#[async_trait]
pub trait InstanceServer: Send + Sync {
    /// Scope subsequent requests to a project. Empty selects the default project.
    fn use_project(&mut self, project: &str);

    /// List full instance details, optionally filtered by instance type.
    async fn instances_full(
        &self,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceFull>, RemoteError>;

    /// Tear down the remote connection. Called exactly once per handle.
    async fn close(&mut self);
}

/// Opens new handles to the host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn InstanceServer>, RemoteError>;
}
