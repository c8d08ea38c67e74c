//! Rendering of the published route tables in Traefik's HTTP-provider shape.
//!
//! ```json
//! {"http": {"services": {"web": {"loadBalancer": {"servers": ["10.0.0.5"], "passHostHeader": true}}}}}
//! ```
//!
//! `servers` always comes first inside `loadBalancer`, followed by the
//! service's options in registry order. An option named `servers` is
//! dropped.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::registry::ServiceKind;
use crate::state::ActiveServerSet;

const SERVERS_KEY: &str = "servers";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("{0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Section<'a> {
    services: BTreeMap<&'a str, Service<'a>>,
}

#[derive(Serialize)]
struct Service<'a> {
    #[serde(rename = "loadBalancer")]
    load_balancer: IndexMap<&'a str, Value>,
}

/// Serialize the `kind` routes of `servers` as the proxy's dynamic config.
pub fn render(kind: ServiceKind, servers: &ActiveServerSet) -> Result<Vec<u8>, ExportError> {
    let mut services = BTreeMap::new();

    for (name, lb) in servers.routes(kind) {
        let mut load_balancer = IndexMap::with_capacity(lb.options.len() + 1);
        load_balancer.insert(SERVERS_KEY, serde_json::to_value(&lb.servers)?);

        for (key, value) in &lb.options {
            if key == SERVERS_KEY {
                tracing::warn!(service = %name, "Ignoring lb_options entry that shadows servers");
                continue;
            }
            load_balancer.insert(key.as_str(), serde_json::to_value(value)?);
        }

        services.insert(name.as_str(), Service { load_balancer });
    }

    let document = IndexMap::from([(kind.as_str(), Section { services })]);
    Ok(serde_json::to_vec(&document)?)
}
