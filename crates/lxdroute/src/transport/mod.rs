//! Transport layer for lxdroute.
//!
//! Exposes the published route tables over HTTP via axum.

pub mod http;

pub use http::{ServerConfig, serve};
