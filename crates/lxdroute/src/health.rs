//! Health status derived from the latest reconciliation pass.

use serde::{Deserialize, Serialize};

use crate::state::ReadinessState;

/// Export readiness of the sidecar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// No registry entries loaded yet
    #[default]
    Starting,
    /// Registry loaded but some services failed to reconcile
    Loading,
    /// Every declared service reconciled in the latest pass
    Ready,
}

impl From<&ReadinessState> for Health {
    fn from(readiness: &ReadinessState) -> Self {
        if readiness.is_ready() {
            Health::Ready
        } else if readiness.total_services == 0 {
            Health::Starting
        } else {
            Health::Loading
        }
    }
}
