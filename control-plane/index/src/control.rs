use crate::{connectivity::Pdp, lb::LoadBalancer};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use mesh_control_plane_core::{
    AccessPolicy, ConnectionRequest, ConnectionResponse, Decider, Decision, Direction, Export,
    Import, Labels, PolicyError, ResourceId, RouteAttempt, RouteError, PEER_NAME_LABEL,
    SERVICE_NAMESPACE_LABEL, SERVICE_NAME_LABEL,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};

/// Authorizes and routes connections against the policies, peers, imports and
/// exports known to this control plane.
#[derive(Debug, Default)]
pub struct ControlIndex {
    pdp: Pdp,
    lb: LoadBalancer,
    registry: RwLock<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    /// Peers currently considered reachable.
    peers: HashSet<String>,
    imports: HashMap<ResourceId, Arc<Import>>,
    exports: HashMap<ResourceId, Export>,
}

/// The number of resources held by a [`ControlIndex`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrySizes {
    pub peers: usize,
    pub imports: usize,
    pub exports: usize,
}

// === impl ControlIndex ===

impl ControlIndex {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pdp(&self) -> &Pdp {
        &self.pdp
    }

    pub fn sizes(&self) -> RegistrySizes {
        let registry = self.registry.read();
        RegistrySizes {
            peers: registry.peers.len(),
            imports: registry.imports.len(),
            exports: registry.exports.len(),
        }
    }

    fn authorize_incoming(&self, req: &ConnectionRequest) -> ConnectionResponse {
        let export = match self.registry.read().exports.get(&req.dst) {
            Some(export) => export.id.clone(),
            None => return ConnectionResponse::service_not_found(),
        };

        let dst = service_attrs(&export, None);
        let decision = self.pdp.decide(&req.src, &dst, &export.namespace);
        debug!(
            matched_by = %decision.matched_by,
            decision = ?decision.decision,
            "Decided incoming connection"
        );
        ConnectionResponse::from_decision(&decision)
    }

    fn authorize_outgoing(
        &self,
        req: &ConnectionRequest,
        attempt: &mut RouteAttempt,
    ) -> Result<ConnectionResponse, RouteError> {
        let import = match self.registry.read().imports.get(&req.dst) {
            Some(import) => import.clone(),
            None => return Ok(ConnectionResponse::service_not_found()),
        };

        let lb = attempt.load_balancing(import.clone());
        let mut denied = None;
        loop {
            if let Err(error) = self.lb.select(lb) {
                // Sources rejected by policy make this a denial rather than an
                // unavailable import.
                return match denied.take() {
                    Some(response) => Ok(response),
                    None => Err(error),
                };
            }
            let source = match lb.source() {
                Some(source) => source.clone(),
                None => continue,
            };

            if !self.registry.read().peers.contains(&source.peer) {
                trace!(peer = %source.peer, "Skipping unreachable peer");
                continue;
            }

            let dst = service_attrs(&import.id, Some(&source.peer));
            let decision = self.pdp.decide(&req.src, &dst, &import.id.namespace);
            if decision.decision == Decision::Allow {
                debug!(
                    peer = %source.peer,
                    matched_by = %decision.matched_by,
                    "Routing outgoing connection"
                );
                let mut response = ConnectionResponse::from_decision(&decision);
                response.peer = Some(source.peer);
                response.export = Some(ResourceId::new(
                    source.export_namespace,
                    source.export_name,
                ));
                return Ok(response);
            }

            trace!(peer = %source.peer, matched_by = %decision.matched_by, "Source denied");
            denied = Some(ConnectionResponse::from_decision(&decision));
        }
    }
}

impl Decider for ControlIndex {
    #[instrument(skip_all, fields(dst = %req.dst, direction = ?req.direction))]
    fn authorize_and_route(
        &self,
        req: &ConnectionRequest,
        attempt: &mut RouteAttempt,
    ) -> Result<ConnectionResponse, RouteError> {
        match req.direction {
            Direction::Incoming => Ok(self.authorize_incoming(req)),
            Direction::Outgoing => self.authorize_outgoing(req, attempt),
        }
    }

    fn add_peer(&self, name: &str) {
        if self.registry.write().peers.insert(name.to_string()) {
            info!(peer = %name, "Peer enabled");
        }
    }

    fn delete_peer(&self, name: &str) {
        if self.registry.write().peers.remove(name) {
            info!(peer = %name, "Peer disabled");
        }
    }

    fn add_import(&self, import: Import) {
        debug!(import = %import.id, sources = import.sources.len(), "Adding import");
        self.registry
            .write()
            .imports
            .insert(import.id.clone(), Arc::new(import));
    }

    fn delete_import(&self, id: &ResourceId) {
        self.registry.write().imports.remove(id);
        self.lb.delete_import(id);
        debug!(import = %id, "Deleted import");
    }

    fn add_export(&self, export: Export) {
        debug!(export = %export.id, "Adding export");
        self.registry
            .write()
            .exports
            .insert(export.id.clone(), export);
    }

    fn delete_export(&self, id: &ResourceId) {
        self.registry.write().exports.remove(id);
        debug!(export = %id, "Deleted export");
    }

    fn add_policy(&self, policy: AccessPolicy) -> Result<(), PolicyError> {
        self.pdp.add_or_update_policy(policy)
    }

    fn delete_policy(&self, id: &ResourceId, privileged: bool) -> Result<(), PolicyError> {
        self.pdp.delete_policy(id, privileged)
    }
}

/// Destination attributes for a connection to `service`, optionally served by `peer`.
fn service_attrs(service: &ResourceId, peer: Option<&str>) -> Labels {
    let mut attrs = vec![
        (SERVICE_NAME_LABEL.to_string(), service.name.clone()),
        (SERVICE_NAMESPACE_LABEL.to_string(), service.namespace.clone()),
    ];
    if let Some(peer) = peer {
        attrs.push((PEER_NAME_LABEL.to_string(), peer.to_string()));
    }
    attrs.into_iter().collect()
}
