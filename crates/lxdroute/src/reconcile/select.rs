//! Instance filtering and endpoint formatting.

use crate::registry::{ServiceDefinition, ServiceKind};
use crate::remote::InstanceFull;

/// HTTP port that is left implicit in exported endpoints.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Interface whose addresses are routed to.
pub const PRIMARY_INTERFACE: &str = "eth0";

const FAMILY_INET: &str = "inet";

/// First IPv4 address on the primary interface.
pub fn primary_ipv4(instance: &InstanceFull) -> Option<&str> {
    instance
        .interface(PRIMARY_INTERFACE)?
        .addresses
        .iter()
        .find(|a| a.family == FAMILY_INET && !a.address.is_empty())
        .map(|a| a.address.as_str())
}

/// Render one backend address the way the proxy expects it for `kind`.
pub fn format_endpoint(kind: ServiceKind, port: u16, address: &str) -> String {
    match kind {
        ServiceKind::Http if port == 0 || port == DEFAULT_HTTP_PORT => address.to_string(),
        ServiceKind::Http => format!("http://{address}:{port}"),
        ServiceKind::Tcp => format!("{address}:{port}"),
    }
}

/// Endpoint for `instance` if it belongs to `service` and is routable.
pub fn endpoint(service: &ServiceDefinition, instance: &InstanceFull) -> Option<String> {
    if !instance.name.starts_with(&service.instance_prefix) || !instance.is_active() {
        return None;
    }
    let address = primary_ipv4(instance)?;
    Some(format_endpoint(service.service_type, service.port, address))
}

/// Endpoints for every routable instance, in listing order.
pub fn endpoints(service: &ServiceDefinition, instances: &[InstanceFull]) -> Vec<String> {
    instances
        .iter()
        .filter_map(|instance| endpoint(service, instance))
        .collect()
}
