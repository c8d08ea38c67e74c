//! HTTP transport: the proxy-facing export endpoints and the health check.

mod routes;
mod server;

pub use routes::{HealthCheckResponse, routes};
pub use server::{ServerConfig, serve};
