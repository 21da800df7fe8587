use crate::{manager::Manager, pods::PodInfo};
use anyhow::{Context, Result};
use mesh_control_plane_core::{AccessPolicy, Decider, Export, Import, Peer};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Resources loaded into the control plane at startup.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Resources {
    #[serde(default)]
    pub peers: Vec<PeerResource>,
    #[serde(default)]
    pub imports: Vec<Import>,
    #[serde(default)]
    pub exports: Vec<Export>,
    #[serde(default)]
    pub policies: Vec<AccessPolicy>,
    #[serde(default)]
    pub pods: Vec<PodInfo>,
}

#[derive(Debug, Deserialize)]
pub struct PeerResource {
    #[serde(flatten)]
    pub peer: Peer,

    /// Whether the peer may be routed to before its first heartbeat.
    #[serde(default = "reachable_by_default")]
    pub reachable: bool,
}

fn reachable_by_default() -> bool {
    true
}

impl Resources {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse resources from {}", path.display()))
    }

    /// Applies all resources to `manager`. Pods and exports go first so that
    /// nothing is routed before its attributes are known.
    pub fn apply<D: Decider>(self, manager: &Manager<D>) -> Result<()> {
        let Self {
            peers,
            imports,
            exports,
            policies,
            pods,
        } = self;
        info!(
            peers = peers.len(),
            imports = imports.len(),
            exports = exports.len(),
            policies = policies.len(),
            pods = pods.len(),
            "Applying resources"
        );

        for pod in pods {
            manager.add_pod(pod);
        }
        for export in exports {
            manager.add_export(export);
        }
        for policy in policies {
            let id = policy.id.clone();
            manager
                .add_policy(policy)
                .with_context(|| format!("invalid policy {id}"))?;
        }
        for import in imports {
            let id = import.id.clone();
            manager
                .add_import(import)
                .with_context(|| format!("invalid import {id}"))?;
        }
        for PeerResource { peer, reachable } in peers {
            let name = peer.name.clone();
            manager
                .add_peer(peer, reachable)
                .with_context(|| format!("invalid peer {name}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{tests::mk_manager, AuthzError, EgressRequest};
    use mesh_control_plane_core::ResourceId;

    const RESOURCES: &str = r#"{
        "peers": [
            { "name": "east", "gateways": [{ "host": "gw.east", "port": 443 }] }
        ],
        "imports": [{
            "namespace": "ns-1",
            "name": "db",
            "port": 5432,
            "lbScheme": "random",
            "sources": [
                { "peer": "east", "exportName": "db", "exportNamespace": "data" }
            ]
        }],
        "exports": [
            { "namespace": "ns-1", "name": "web", "host": "web.ns-1", "port": 80 }
        ],
        "policies": [{
            "namespace": "ns-1",
            "name": "allow-all",
            "action": "allow",
            "from": [{ "workloadSelector": {} }],
            "to": [{ "workloadSelector": {} }]
        }],
        "pods": [{
            "namespace": "ns-1",
            "name": "api-0",
            "labels": { "app": "api" },
            "podIps": ["10.1.0.7"]
        }]
    }"#;

    #[tokio::test]
    async fn load_and_apply() {
        let resources = serde_json::from_str::<Resources>(RESOURCES).unwrap();
        assert!(resources.peers[0].reachable);

        let (manager, _) = mk_manager(&[("east", Err(()))]);
        resources.apply(&manager).unwrap();

        // Routing reaches east, whose fake client always fails.
        let error = manager
            .authorize_egress(EgressRequest {
                import: ResourceId::new("ns-1", "db"),
                client_ip: "10.1.0.7".parse().unwrap(),
            })
            .await
            .unwrap_err();
        assert!(matches!(error, AuthzError::Peer { .. }), "{error}");
    }

    #[test]
    fn rejects_unknown_fields() {
        let error = serde_json::from_str::<Resources>(r#"{"services": []}"#).unwrap_err();
        assert!(error.to_string().contains("services"), "{error}");
    }

    #[test]
    fn invalid_policy() {
        let resources = serde_json::from_str::<Resources>(
            r#"{"policies": [{
                "namespace": "ns-1",
                "name": "empty",
                "action": "deny",
                "from": [],
                "to": [{ "workloadSelector": {} }]
            }]}"#,
        )
        .unwrap();
        let (manager, _) = mk_manager(&[]);
        let error = resources.apply(&manager).unwrap_err();
        assert_eq!(error.to_string(), "invalid policy ns-1/empty");
    }
}
