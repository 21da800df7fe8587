use ahash::AHashMap as HashMap;
use mesh_control_plane_core::{Labels, ResourceId};
use parking_lot::RwLock;
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{debug, trace};

/// Resolves the labels of local pods by IP address.
#[derive(Debug, Default)]
pub struct PodIndex {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    by_ip: HashMap<IpAddr, ResourceId>,
    pods: HashMap<ResourceId, Pod>,
}

#[derive(Debug)]
struct Pod {
    labels: Labels,
    ips: Vec<IpAddr>,
}

/// A pod add or update event.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    #[serde(flatten)]
    pub id: ResourceId,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub pod_ips: Vec<IpAddr>,
    pub host_ip: Option<IpAddr>,
}

// === impl PodIndex ===

impl PodIndex {
    /// Indexes a pod by its IPs. Host-networked IPs are not indexed as they are
    /// shared by every host-networked pod on the node.
    pub fn apply(&self, pod: PodInfo) {
        let PodInfo {
            id,
            labels,
            pod_ips,
            host_ip,
        } = pod;
        let ips = pod_ips
            .into_iter()
            .filter(|ip| Some(*ip) != host_ip)
            .collect::<Vec<_>>();

        let mut inner = self.inner.write();
        inner.remove(&id);
        for ip in &ips {
            inner.by_ip.insert(*ip, id.clone());
        }
        debug!(pod = %id, ips = ?ips, "Indexed pod");
        inner.pods.insert(id, Pod { labels, ips });
    }

    pub fn delete(&self, id: &ResourceId) {
        if self.inner.write().remove(id) {
            debug!(pod = %id, "Removed pod");
        }
    }

    pub fn labels(&self, ip: IpAddr) -> Option<Labels> {
        let inner = self.inner.read();
        let id = inner.by_ip.get(&ip)?;
        let labels = inner.pods.get(id).map(|pod| pod.labels.clone());
        trace!(%ip, pod = %id, ?labels, "Resolved pod");
        labels
    }
}

impl Inner {
    fn remove(&mut self, id: &ResourceId) -> bool {
        let Some(pod) = self.pods.remove(id) else {
            return false;
        };
        for ip in pod.ips {
            // The IP may have been reassigned to another pod already.
            if self.by_ip.get(&ip) == Some(id) {
                self.by_ip.remove(&ip);
            }
        }
        true
    }
}
