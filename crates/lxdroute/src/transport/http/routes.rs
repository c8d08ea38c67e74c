//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::export::render;
use crate::health::Health;
use crate::registry::ServiceKind;
use crate::state::{EngineState, ServerState};
use crate::version::VersionInfo;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    pub loaded: usize,
    pub total: usize,
    pub engine: EngineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub version: VersionInfo,
}

impl HealthCheckResponse {
    pub fn from_state(state: &ServerState) -> Self {
        let readiness = state.readiness();
        Self {
            status: Health::from(&readiness),
            loaded: readiness.loaded_services,
            total: readiness.total_services,
            engine: state.engine(),
            completed_at: readiness.completed_at,
            version: VersionInfo::new(),
        }
    }
}

async fn health_check(State(state): State<Arc<ServerState>>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse::from_state(&state))
}

/// Export one kind's routes, or 423 with progress text while not ready.
fn export(state: &ServerState, kind: ServiceKind) -> Response {
    let snapshot = state.snapshot();
    if !snapshot.readiness.is_ready() {
        return (StatusCode::LOCKED, snapshot.readiness.progress()).into_response();
    }

    match render(kind, &snapshot.servers) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(kind = %kind, error = %e, "Failed to render routes");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("error marshaling json, err: {e}"),
            )
                .into_response()
        }
    }
}

async fn http_services(State(state): State<Arc<ServerState>>) -> Response {
    export(&state, ServiceKind::Http)
}

async fn tcp_services(State(state): State<Arc<ServerState>>) -> Response {
    export(&state, ServiceKind::Tcp)
}

pub fn routes(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/services/http", get(http_services))
        .route("/services/tcp", get(tcp_services))
        .with_state(state)
}
