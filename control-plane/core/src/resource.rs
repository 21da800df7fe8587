use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a namespaced resource.
///
/// Cluster-scoped resources (privileged policies) use an empty namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ResourceId {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

/// A local handle on a service exported by one or more remote peers.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Import {
    #[serde(flatten)]
    pub id: ResourceId,

    /// The service port exposed to local workloads.
    pub port: u16,

    /// The port the dataplane listens on. Zero requests automatic allocation.
    #[serde(default)]
    pub target_port: u16,

    pub sources: Vec<ImportSource>,

    #[serde(default)]
    pub lb_scheme: LbScheme,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSource {
    pub peer: String,
    pub export_name: String,
    pub export_namespace: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LbScheme {
    #[default]
    RoundRobin,
    Random,
    Static,
}

/// A local service made reachable to remote peers.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Export {
    #[serde(flatten)]
    pub id: ResourceId,
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Peer {
    pub name: String,
    pub gateways: Vec<Endpoint>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identifies a cluster-scoped resource.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            return self.name.fmt(f);
        }
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl LbScheme ===

impl std::str::FromStr for LbScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "round-robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "static" => Ok(Self::Static),
            s => Err(format!("unknown load-balancing scheme: {s}")),
        }
    }
}

// === impl Endpoint ===

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
