use crate::{Labels, ResourceId};

/// Reported as the matching policy when no policy matched a connection.
pub const DEFAULT_DENY: &str = "<default deny>";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Decision {
    Allow,
    Deny,
    Undecided,
}

/// The outcome of evaluating policies against one destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationDecision {
    pub destination: Labels,
    pub decision: Decision,
    pub matched_by: String,
    pub privileged_match: bool,
}

/// A connection to be authorized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub src: Labels,

    /// The import (outgoing) or export (incoming) being connected to.
    pub dst: ResourceId,

    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub action: Decision,

    /// False when the targeted import or export is not known locally.
    pub service_exists: bool,

    pub matched_by: Option<String>,

    /// For allowed outgoing connections, the peer serving the connection.
    pub peer: Option<String>,

    /// For allowed outgoing connections, the export on `peer`.
    pub export: Option<ResourceId>,
}

// === impl ConnectionResponse ===

impl ConnectionResponse {
    pub fn service_not_found() -> Self {
        Self {
            action: Decision::Deny,
            service_exists: false,
            matched_by: None,
            peer: None,
            export: None,
        }
    }

    pub fn from_decision(decision: &DestinationDecision) -> Self {
        Self {
            action: decision.decision,
            service_exists: true,
            matched_by: Some(decision.matched_by.clone()),
            peer: None,
            export: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.action == Decision::Allow
    }
}
