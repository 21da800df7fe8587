#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod connection;
mod error;
pub mod labels;
pub mod lb;
pub mod policy;
mod resource;

pub use self::{
    connection::{
        ConnectionRequest, ConnectionResponse, Decision, DestinationDecision, Direction,
        DEFAULT_DENY,
    },
    error::{PolicyError, RouteError},
    labels::{Labels, Selector},
    lb::{LoadBalancingResult, RouteAttempt},
    policy::{AccessPolicy, PolicyAction, WorkloadSetOrSelector},
    resource::{Endpoint, Export, Import, ImportSource, LbScheme, Peer, ResourceId},
};

/// The pod label copied into the source attributes of egress connections.
pub const APP_LABEL: &str = "app";

/// Names the peer on the remote side of a connection.
pub const PEER_NAME_LABEL: &str = "peer.name";

/// Names the import or export a connection targets.
pub const SERVICE_NAME_LABEL: &str = "service.name";

/// Namespace of the import or export a connection targets.
pub const SERVICE_NAMESPACE_LABEL: &str = "service.namespace";

/// Authorizes cross-peer connections and routes outgoing ones to a concrete source.
///
/// Implementations own policy evaluation, load balancing and the registry of
/// reachable peers, imports and exports. Callers only see this narrow boundary.
pub trait Decider: Send + Sync + 'static {
    /// Decides whether `req` is allowed. For outgoing requests, `attempt` carries
    /// the load-balancing state across retries of the same logical connection and
    /// an allowed response names the chosen peer.
    fn authorize_and_route(
        &self,
        req: &ConnectionRequest,
        attempt: &mut RouteAttempt,
    ) -> Result<ConnectionResponse, RouteError>;

    /// Marks a peer as reachable so that its import sources may be selected.
    fn add_peer(&self, name: &str);

    fn delete_peer(&self, name: &str);

    fn add_import(&self, import: Import);

    fn delete_import(&self, id: &ResourceId);

    fn add_export(&self, export: Export);

    fn delete_export(&self, id: &ResourceId);

    fn add_policy(&self, policy: AccessPolicy) -> Result<(), PolicyError>;

    fn delete_policy(&self, id: &ResourceId, privileged: bool) -> Result<(), PolicyError>;
}
