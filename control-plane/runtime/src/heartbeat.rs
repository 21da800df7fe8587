use crate::manager::Manager;
use ahash::AHashMap as HashMap;
use futures::future;
use mesh_control_plane_core::Decider;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically checks every registered peer and enables routing only to the
/// peers that answer.
pub struct Monitor<D> {
    manager: Arc<Manager<D>>,
    reachable: HashMap<String, bool>,
}

impl<D: Decider> Monitor<D> {
    pub fn new(manager: Arc<Manager<D>>) -> Self {
        Self {
            manager,
            reachable: HashMap::default(),
        }
    }

    pub async fn run(mut self, interval: Duration) {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            self.check_peers().await;
        }
    }

    /// Checks all peers concurrently and records reachability changes.
    pub(crate) async fn check_peers(&mut self) {
        // Snapshot the clients so no lock is held across the requests.
        let clients = self.manager.peer_clients();
        let results = future::join_all(clients.iter().map(|(name, client)| async move {
            (name.as_str(), client.heartbeat().await)
        }))
        .await;

        self.reachable
            .retain(|name, _| clients.iter().any(|(peer, _)| peer == name));

        for (name, result) in results {
            let reachable = result.is_ok();
            match (self.reachable.insert(name.to_string(), reachable), &result) {
                (Some(prior), _) if prior == reachable => continue,
                (_, Ok(())) => info!(peer = %name, "Peer is reachable"),
                (None, Err(error)) => debug!(peer = %name, %error, "Peer is unreachable"),
                (Some(_), Err(error)) => warn!(peer = %name, %error, "Peer became unreachable"),
            }
            self.manager.set_peer_reachable(name, reachable);
        }
    }
}
