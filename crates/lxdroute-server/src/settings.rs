//! Process settings, from flags or the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use lxdroute::{PoolConfig, transport::ServerConfig};

#[derive(Debug, Clone, Parser)]
#[command(name = "lxdroute-server")]
#[command(about = "Traefik HTTP provider backed by LXD instance discovery", long_about = None)]
#[command(version)]
pub struct Settings {
    /// Address the export endpoints listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// LXD API endpoint
    #[arg(long, env = "LXD_SERVER_URL", default_value = "https://localhost:8443")]
    pub lxd_server_url: String,

    /// PEM client certificate trusted by the LXD host
    #[arg(long, env = "CERT_PATH", default_value = "certs/lxd-traefik.crt")]
    pub cert_path: PathBuf,

    /// PEM private key for the client certificate
    #[arg(long, env = "KEY_PATH", default_value = "certs/lxd-traefik.key")]
    pub key_path: PathBuf,

    /// Service registry, reloaded on every tick
    #[arg(long, env = "SERVICES_FILE", default_value = "config/services.yaml")]
    pub services_file: PathBuf,

    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 20)]
    pub reconcile_interval_secs: u64,

    #[arg(long, env = "REAPER_INTERVAL_SECS", default_value_t = 10)]
    pub reaper_interval_secs: u64,

    #[arg(long, env = "MAX_POOL_SIZE", default_value_t = 10)]
    pub max_pool_size: usize,

    #[arg(long, env = "MAX_IDLE_SESSIONS", default_value_t = 8)]
    pub max_idle_sessions: usize,

    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Reconcile workers; 0 queries services one at a time
    #[arg(long, env = "WORKERS", default_value_t = 10)]
    pub workers: usize,
}

impl Settings {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.listen.ip().to_string(),
            port: self.listen.port(),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_pool_size: self.max_pool_size,
            max_idle_sessions: self.max_idle_sessions,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            prewarm: None,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    /// Plain `http://` hosts are reached without a client certificate.
    pub fn uses_tls(&self) -> bool {
        !self.lxd_server_url.starts_with("http://")
    }
}
