use crate::tls::TlsConfig;
use mesh_control_plane_core::Peer;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, instrument};

pub const AUTHORIZE_PATH: &str = "/peer/authz";
pub const HEARTBEAT_PATH: &str = "/heartbeat";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAuthorizeRequest {
    pub service_name: String,
    pub service_namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAuthorizeResponse {
    pub service_exists: bool,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// The control-plane API of a remote peer.
#[async_trait::async_trait]
pub trait PeerApi: Send + Sync {
    /// Asks the peer to authorize a connection to one of its exports.
    async fn authorize(
        &self,
        req: &PeerAuthorizeRequest,
    ) -> Result<PeerAuthorizeResponse, PeerError>;

    async fn heartbeat(&self) -> Result<(), PeerError>;
}

/// Builds clients for peers as they are added.
pub trait Connect: Send + Sync + 'static {
    fn connect(&self, peer: &Peer) -> Result<Arc<dyn PeerApi>, PeerError>;
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {0} has no gateways")]
    NoGateways(String),

    #[error("failed to build client for peer {peer}: {source}")]
    Client {
        peer: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} responded with {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },

    #[error("all gateways failed: {}", Joined(.0))]
    AllFailed(Vec<PeerError>),
}

/// Connects to peers over HTTPS (or plain HTTP when no TLS is configured).
#[derive(Clone, Debug)]
pub struct HttpConnector {
    tls: Option<TlsConfig>,
    timeout: Duration,
    connect_timeout: Duration,
}

/// A client for one peer, trying each of its gateways in turn.
#[derive(Debug)]
pub struct PeerClient {
    peer: String,
    endpoints: Vec<String>,
    http: reqwest::Client,
}

struct Joined<'e>(&'e [PeerError]);

// === impl HttpConnector ===

impl HttpConnector {
    pub fn new(tls: Option<TlsConfig>, timeout: Duration) -> Self {
        Self {
            tls,
            timeout,
            connect_timeout: timeout.min(Duration::from_secs(2)),
        }
    }

    fn client(&self, peer: &str) -> Result<reqwest::Client, PeerError> {
        let err = |source| PeerError::Client {
            peer: peer.to_string(),
            source,
        };

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout);
        if let Some(tls) = &self.tls {
            let root = reqwest::Certificate::from_pem(&tls.trust_bundle).map_err(err)?;
            let identity = reqwest::Identity::from_pem(&tls.identity).map_err(err)?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(root)
                .identity(identity);
        }
        builder.build().map_err(err)
    }
}

impl Connect for HttpConnector {
    fn connect(&self, peer: &Peer) -> Result<Arc<dyn PeerApi>, PeerError> {
        if peer.gateways.is_empty() {
            return Err(PeerError::NoGateways(peer.name.clone()));
        }

        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let endpoints = peer
            .gateways
            .iter()
            .map(|gw| format!("{scheme}://{gw}"))
            .collect();
        Ok(Arc::new(PeerClient {
            peer: peer.name.clone(),
            endpoints,
            http: self.client(&peer.name)?,
        }))
    }
}

// === impl PeerClient ===

impl PeerClient {
    async fn post_authorize(
        &self,
        endpoint: &str,
        req: &PeerAuthorizeRequest,
    ) -> Result<PeerAuthorizeResponse, PeerError> {
        let url = format!("{endpoint}{AUTHORIZE_PATH}");
        let rsp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|source| PeerError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;
        if !rsp.status().is_success() {
            return Err(PeerError::Status {
                endpoint: endpoint.to_string(),
                status: rsp.status(),
            });
        }
        rsp.json().await.map_err(|source| PeerError::Request {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    async fn get_heartbeat(&self, endpoint: &str) -> Result<(), PeerError> {
        let url = format!("{endpoint}{HEARTBEAT_PATH}");
        let rsp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| PeerError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;
        if !rsp.status().is_success() {
            return Err(PeerError::Status {
                endpoint: endpoint.to_string(),
                status: rsp.status(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PeerApi for PeerClient {
    #[instrument(skip_all, fields(peer = %self.peer))]
    async fn authorize(
        &self,
        req: &PeerAuthorizeRequest,
    ) -> Result<PeerAuthorizeResponse, PeerError> {
        let mut errors = vec![];
        for endpoint in &self.endpoints {
            match self.post_authorize(endpoint, req).await {
                Ok(rsp) => return Ok(rsp),
                Err(error) => {
                    debug!(%error, "Gateway authorization failed");
                    errors.push(error);
                }
            }
        }
        Err(PeerError::AllFailed(errors))
    }

    #[instrument(skip_all, fields(peer = %self.peer))]
    async fn heartbeat(&self) -> Result<(), PeerError> {
        let mut errors = vec![];
        for endpoint in &self.endpoints {
            match self.get_heartbeat(endpoint).await {
                Ok(()) => return Ok(()),
                Err(error) => errors.push(error),
            }
        }
        Err(PeerError::AllFailed(errors))
    }
}

// === impl Joined ===

impl fmt::Display for Joined<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            fmt::Display::fmt(error, f)?;
        }
        Ok(())
    }
}
