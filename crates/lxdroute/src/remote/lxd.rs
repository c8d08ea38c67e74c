//! LXD REST API client.
//!
//! Each session owns its own `reqwest::Client`, authenticated with the TLS
//! client certificate trusted by the LXD host. Closing a session drops the
//! client, which tears down its pooled connections.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{Connector, InstanceFull, InstanceServer, InstanceType, RemoteError};
use crate::version::LXDROUTE_VERSION;

/// Server URL and client identity used to open sessions.
#[derive(Clone)]
pub struct Credentials {
    server_url: String,
    identity_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("server_url", &self.server_url)
            .field("identity", &self.identity_pem.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    /// Credentials without a client identity (plain HTTP or unauthenticated hosts).
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            identity_pem: None,
        }
    }

    /// Attach a PEM client certificate and private key.
    pub fn with_identity(mut self, cert_pem: &[u8], key_pem: &[u8]) -> Self {
        let mut pem = Vec::with_capacity(cert_pem.len() + key_pem.len() + 1);
        pem.extend_from_slice(cert_pem);
        if !cert_pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(key_pem);
        self.identity_pem = Some(pem);
        self
    }

    /// Read the client certificate and key from disk.
    pub fn from_files(
        server_url: impl Into<String>,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, RemoteError> {
        let cert = std::fs::read(cert_path).map_err(|e| {
            RemoteError::InvalidCredentials(format!("{}: {}", cert_path.display(), e))
        })?;
        let key = std::fs::read(key_path).map_err(|e| {
            RemoteError::InvalidCredentials(format!("{}: {}", key_path.display(), e))
        })?;
        Ok(Self::new(server_url).with_identity(&cert, &key))
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Opens authenticated sessions against one LXD host.
#[derive(Debug, Clone)]
pub struct LxdConnector {
    credentials: Credentials,
    request_timeout: Duration,
}

impl LxdConnector {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn build_client(&self) -> Result<reqwest::Client, RemoteError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let user_agent = format!("lxdroute/{}", LXDROUTE_VERSION);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        // LXD hosts serve self-signed certificates; trust is established by
        // the client certificate instead.
        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(true);

        if let Some(pem) = &self.credentials.identity_pem {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| RemoteError::InvalidCredentials(e.to_string()))?;
            builder = builder.identity(identity);
        }

        builder.build().map_err(|e| RemoteError::Connect {
            url: self.credentials.server_url.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Connector for LxdConnector {
    async fn connect(&self) -> Result<Box<dyn InstanceServer>, RemoteError> {
        let session = LxdSession {
            client: Some(self.build_client()?),
            base_url: self.credentials.server_url.clone(),
            project: None,
        };

        session
            .get::<serde_json::Value>("/1.0", &[])
            .await
            .map_err(|e| RemoteError::Connect {
                url: session.base_url.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(url = %session.base_url, "Opened LXD session");
        Ok(Box::new(session))
    }
}

/// Standard LXD response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: u16,
    metadata: Option<T>,
}

/// A single authenticated connection to the LXD API.
pub struct LxdSession {
    client: Option<reqwest::Client>,
    base_url: String,
    project: Option<String>,
}

impl LxdSession {
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RemoteError> {
        let client = self.client.as_ref().ok_or(RemoteError::Closed)?;
        let url = format!("{}{}", self.base_url, path);

        let response = client.get(&url).query(query).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<Envelope<serde_json::Value>>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> =
            serde_json::from_slice(&body).map_err(|e| RemoteError::Decode(e.to_string()))?;

        if envelope.kind == "error" {
            return Err(RemoteError::Status {
                status: envelope.error_code,
                message: envelope.error,
            });
        }

        envelope
            .metadata
            .ok_or_else(|| RemoteError::Decode(format!("{} returned no metadata", path)))
    }
}

#[async_trait]
impl InstanceServer for LxdSession {
    fn use_project(&mut self, project: &str) {
        self.project = if project.is_empty() {
            None
        } else {
            Some(project.to_string())
        };
    }

    async fn instances_full(
        &self,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceFull>, RemoteError> {
        let mut query = vec![("recursion", "2")];
        if let Some(project) = self.project.as_deref() {
            query.push(("project", project));
        }
        if let Some(kind) = instance_type.as_query() {
            query.push(("instance-type", kind));
        }
        self.get("/1.0/instances", &query).await
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            tracing::debug!(url = %self.base_url, "Closed LXD session");
        }
    }
}
