use crate::{
    metrics::{AuthzMetrics, Flow, Outcome},
    peer::{Connect, PeerApi, PeerAuthorizeRequest, PeerError},
    pods::{PodIndex, PodInfo},
    token::{AccessTokens, TokenError},
};
use ahash::AHashMap as HashMap;
use http::StatusCode;
use mesh_control_plane_core::{
    AccessPolicy, ConnectionRequest, Decider, Direction, Export, Import, Labels, Peer,
    PolicyError, ResourceId, RouteAttempt, RouteError, APP_LABEL, PEER_NAME_LABEL,
};
use mesh_control_plane_index::{LeaseError, PortManager};
use parking_lot::RwLock;
use std::{net::IpAddr, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Authorizes connections leaving and entering this peer.
///
/// Egress connections are routed to a remote peer chosen by the decider and
/// authorized by that peer, which returns an access token. Ingress requests from
/// remote peers are authorized locally and answered with a token the local
/// dataplane verifies before forwarding the connection to the export.
pub struct Manager<D> {
    decider: Arc<D>,
    connect: Arc<dyn Connect>,
    peers: RwLock<HashMap<String, Arc<dyn PeerApi>>>,
    ports: PortManager<ResourceId>,
    pods: PodIndex,
    tokens: AccessTokens,
    metrics: AuthzMetrics,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EgressRequest {
    pub import: ResourceId,
    pub client_ip: IpAddr,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EgressResponse {
    pub service_exists: bool,
    pub allowed: bool,
    pub target_cluster: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressRequest {
    pub service: ResourceId,

    /// The requesting peer, as named by its verified client certificate.
    pub peer: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressResponse {
    pub service_exists: bool,
    pub allowed: bool,
    pub access_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("missing client for peer {0}")]
    MissingClient(String),

    #[error("peer {peer} failed to authorize connection: {source}")]
    Peer {
        peer: String,
        #[source]
        source: PeerError,
    },

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Lease(#[from] LeaseError<ResourceId>),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Connect(PeerError),
}

/// The dataplane cluster serving connections to a remote peer.
pub fn remote_peer_cluster(peer: &str) -> String {
    format!("remote-peer/{peer}")
}

/// The dataplane cluster serving connections to a local export.
pub fn export_cluster(export: &ResourceId) -> String {
    format!("export/{}/{}", export.namespace, export.name)
}

// === impl Manager ===

impl<D: Decider> Manager<D> {
    pub fn new(
        decider: Arc<D>,
        connect: Arc<dyn Connect>,
        tokens: AccessTokens,
        metrics: AuthzMetrics,
    ) -> Self {
        Self {
            decider,
            connect,
            peers: RwLock::new(HashMap::default()),
            ports: PortManager::default(),
            pods: PodIndex::default(),
            tokens,
            metrics,
        }
    }

    /// Authorizes a local client's connection to an import.
    #[instrument(skip_all, fields(import = %req.import, client = %req.client_ip))]
    pub async fn authorize_egress(&self, req: EgressRequest) -> Result<EgressResponse, AuthzError> {
        let conn = ConnectionRequest {
            src: self.source_attrs(req.client_ip),
            dst: req.import,
            direction: Direction::Outgoing,
        };

        let res = self.route_egress(&conn).await;
        self.metrics.decision(
            Flow::Egress,
            match &res {
                Ok(rsp) if !rsp.service_exists => Outcome::NotFound,
                Ok(rsp) if rsp.allowed => Outcome::Allowed,
                Ok(_) => Outcome::Denied,
                Err(_) => Outcome::Error,
            },
        );
        res
    }

    async fn route_egress(&self, conn: &ConnectionRequest) -> Result<EgressResponse, AuthzError> {
        let mut attempt = RouteAttempt::default();
        let mut last_error = None;
        loop {
            let rsp = match self.decider.authorize_and_route(conn, &mut attempt) {
                Ok(rsp) => rsp,
                Err(error) => return Err(last_error.unwrap_or(AuthzError::Route(error))),
            };
            if !rsp.service_exists {
                return Ok(EgressResponse::default());
            }
            let (Some(peer), Some(export)) = (rsp.peer.clone(), rsp.export.clone()) else {
                debug!(matched_by = ?rsp.matched_by, "Connection denied");
                return Ok(EgressResponse {
                    service_exists: true,
                    ..Default::default()
                });
            };

            // Clone the client out so the lock is not held across the request.
            let client = self.peers.read().get(&peer).cloned();
            let client = client.ok_or_else(|| AuthzError::MissingClient(peer.clone()))?;

            let req = PeerAuthorizeRequest {
                service_name: export.name,
                service_namespace: export.namespace,
            };
            match client.authorize(&req).await {
                Ok(remote) => {
                    debug!(
                        %peer,
                        allowed = remote.allowed,
                        exists = remote.service_exists,
                        "Peer responded"
                    );
                    let target_cluster = remote.allowed.then(|| remote_peer_cluster(&peer));
                    return Ok(EgressResponse {
                        service_exists: remote.service_exists,
                        allowed: remote.allowed,
                        target_cluster,
                        access_token: remote.access_token,
                    });
                }
                Err(error) => {
                    warn!(%peer, %error, "Failed to reach peer");
                    self.metrics.peer_error(&peer);
                    // Retry this source once every other source has been tried.
                    if !attempt.is_delayed() {
                        attempt.delay();
                    }
                    last_error = Some(AuthzError::Peer {
                        peer,
                        source: error,
                    });
                }
            }
        }
    }

    /// Authorizes a remote peer's request to connect to a local export,
    /// issuing an access token when allowed.
    #[instrument(skip_all, fields(service = %req.service, peer = %req.peer))]
    pub fn authorize_ingress(&self, req: IngressRequest) -> Result<IngressResponse, AuthzError> {
        let conn = ConnectionRequest {
            src: std::iter::once((PEER_NAME_LABEL.to_string(), req.peer)).collect(),
            dst: req.service,
            direction: Direction::Incoming,
        };

        let res = self.decide_ingress(&conn);
        self.metrics.decision(
            Flow::Ingress,
            match &res {
                Ok(rsp) if !rsp.service_exists => Outcome::NotFound,
                Ok(rsp) if rsp.allowed => Outcome::Allowed,
                Ok(_) => Outcome::Denied,
                Err(_) => Outcome::Error,
            },
        );
        res
    }

    fn decide_ingress(&self, conn: &ConnectionRequest) -> Result<IngressResponse, AuthzError> {
        let rsp = self
            .decider
            .authorize_and_route(conn, &mut RouteAttempt::default())?;
        if !rsp.service_exists || !rsp.is_allowed() {
            debug!(exists = rsp.service_exists, matched_by = ?rsp.matched_by, "Connection denied");
            return Ok(IngressResponse {
                service_exists: rsp.service_exists,
                ..Default::default()
            });
        }

        let token = self.tokens.issue(&conn.dst)?;
        Ok(IngressResponse {
            service_exists: true,
            allowed: true,
            access_token: Some(token),
        })
    }

    /// Verifies an access token presented by the local dataplane and returns
    /// the cluster serving the export it authorizes.
    pub fn verify_token(&self, token: &str) -> Result<String, AuthzError> {
        match self.tokens.verify(token) {
            Ok(export) => {
                self.metrics.decision(Flow::Token, Outcome::Allowed);
                Ok(export_cluster(&export))
            }
            Err(error) => {
                debug!(%error, "Rejected access token");
                self.metrics.decision(Flow::Token, Outcome::Denied);
                Err(error.into())
            }
        }
    }

    /// Registers a peer's client, enabling it for routing if it is reachable.
    pub fn add_peer(&self, peer: Peer, reachable: bool) -> Result<(), AuthzError> {
        let client = self.connect.connect(&peer).map_err(AuthzError::Connect)?;
        let mut peers = self.peers.write();
        peers.insert(peer.name.clone(), client);
        self.route_to_peer(&peer.name, reachable);
        drop(peers);
        info!(peer = %peer.name, gateways = peer.gateways.len(), reachable, "Added peer");
        Ok(())
    }

    pub fn delete_peer(&self, name: &str) {
        let mut peers = self.peers.write();
        peers.remove(name);
        self.decider.delete_peer(name);
        drop(peers);
        info!(peer = %name, "Deleted peer");
    }

    /// Enables or disables routing to a registered peer. Unknown peers are
    /// ignored.
    pub fn set_peer_reachable(&self, name: &str, reachable: bool) {
        // The decider is updated under the client lock so that a concurrent
        // delete cannot re-enable a peer without a client.
        let peers = self.peers.read();
        if !peers.contains_key(name) {
            debug!(peer = %name, "Ignoring reachability of unknown peer");
            return;
        }
        self.route_to_peer(name, reachable);
    }

    /// Snapshots the registered peer clients.
    pub fn peer_clients(&self) -> Vec<(String, Arc<dyn PeerApi>)> {
        self.peers
            .read()
            .iter()
            .map(|(name, client)| (name.clone(), client.clone()))
            .collect()
    }

    /// Leases the import's target port (allocating one when it is zero) and
    /// registers the import. Returns the import with its leased port.
    pub fn add_import(&self, mut import: Import) -> Result<Import, AuthzError> {
        import.target_port = self.ports.lease(&import.id, import.target_port)?;
        info!(import = %import.id, port = import.target_port, "Added import");
        self.decider.add_import(import.clone());
        Ok(import)
    }

    pub fn delete_import(&self, id: &ResourceId) {
        self.decider.delete_import(id);
        self.ports.release(id);
        info!(import = %id, "Deleted import");
    }

    pub fn add_export(&self, export: Export) {
        info!(export = %export.id, "Added export");
        self.decider.add_export(export);
    }

    pub fn delete_export(&self, id: &ResourceId) {
        self.decider.delete_export(id);
        info!(export = %id, "Deleted export");
    }

    pub fn add_policy(&self, policy: AccessPolicy) -> Result<(), AuthzError> {
        Ok(self.decider.add_policy(policy)?)
    }

    pub fn delete_policy(&self, id: &ResourceId, privileged: bool) -> Result<(), AuthzError> {
        Ok(self.decider.delete_policy(id, privileged)?)
    }

    pub fn add_pod(&self, pod: PodInfo) {
        self.pods.apply(pod);
    }

    pub fn delete_pod(&self, id: &ResourceId) {
        self.pods.delete(id);
    }

    fn route_to_peer(&self, name: &str, reachable: bool) {
        if reachable {
            self.decider.add_peer(name);
        } else {
            self.decider.delete_peer(name);
        }
    }

    fn source_attrs(&self, ip: IpAddr) -> Labels {
        let Some(labels) = self.pods.labels(ip) else {
            debug!(%ip, "Client is not a known pod");
            return Labels::default();
        };
        labels
            .get(APP_LABEL)
            .map(|app| (APP_LABEL.to_string(), app.to_string()))
            .into_iter()
            .collect()
    }
}

// === impl AuthzError ===

impl AuthzError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Route(_) | Self::MissingClient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Peer { .. } => StatusCode::BAD_GATEWAY,
            Self::Token(TokenError::Key(_) | TokenError::Sign(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Token(_) => StatusCode::UNAUTHORIZED,
            Self::Lease(LeaseError::Conflict { .. }) => StatusCode::CONFLICT,
            Self::Lease(LeaseError::Exhausted) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Policy(PolicyError::Invalid { .. }) => StatusCode::BAD_REQUEST,
            Self::Policy(PolicyError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Connect(_) => StatusCode::BAD_REQUEST,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests;
