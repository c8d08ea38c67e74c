//! Version information for lxdroute.

/// lxdroute version from Cargo.toml
pub const LXDROUTE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub lxdroute: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            lxdroute: LXDROUTE_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
