use ahash::AHashMap as HashMap;
use mesh_control_plane_core::{LbScheme, LoadBalancingResult, ResourceId, RouteError};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tracing::trace;

/// Selects a source among an import's sources for each connection attempt.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    imports: RwLock<HashMap<ResourceId, Arc<ImportState>>>,
}

/// Round-robin state shared by all connections to one import.
#[derive(Debug, Default)]
struct ImportState {
    round_robin: AtomicUsize,
}

// === impl LoadBalancer ===

impl LoadBalancer {
    /// Selects the next source for `result`.
    ///
    /// Any previous selection is recorded as failed. Once every source has
    /// failed, delayed sources are handed out in the order they were delayed;
    /// after that, selection fails.
    pub fn select(&self, result: &mut LoadBalancingResult) -> Result<(), RouteError> {
        result.fail_current();

        let sources = result.import().sources.len();
        if result.failed().len() >= sources {
            return match result.pop_delayed() {
                Some(i) => {
                    trace!(import = %result.import().id, index = i, "Retrying delayed source");
                    result.set_current(i);
                    Ok(())
                }
                None => Err(RouteError::Exhausted { sources }),
            };
        }

        let index = match result.import().lb_scheme {
            LbScheme::Random => Self::random(result, sources),
            LbScheme::RoundRobin => self.round_robin(result, sources),
            LbScheme::Static => Self::fixed(result, sources)?,
        };
        trace!(
            import = %result.import().id,
            scheme = ?result.import().lb_scheme,
            index,
            "Selected source"
        );
        result.set_current(index);
        Ok(())
    }

    /// Drops the round-robin state of a deleted import.
    pub fn delete_import(&self, id: &ResourceId) {
        self.imports.write().remove(id);
    }

    fn random(result: &LoadBalancingResult, sources: usize) -> usize {
        let mut index = rand::thread_rng().gen_range(0..sources);
        while result.failed().contains(&index) {
            index = (index + 1) % sources;
        }
        index
    }

    fn round_robin(&self, result: &LoadBalancingResult, sources: usize) -> usize {
        match result.current() {
            Some(current) => (current + 1) % sources,
            None => {
                let state = self.state(&result.import().id);
                state.round_robin.fetch_add(1, Ordering::Relaxed) % sources
            }
        }
    }

    /// Walks the sources in order. The index is bounded by the current number
    /// of sources so that a shrinking import cannot select past its end.
    fn fixed(result: &LoadBalancingResult, sources: usize) -> Result<usize, RouteError> {
        let index = result.current().map_or(0, |i| i + 1);
        if index >= sources {
            return Err(RouteError::Exhausted { sources });
        }
        Ok(index)
    }

    fn state(&self, id: &ResourceId) -> Arc<ImportState> {
        if let Some(state) = self.imports.read().get(id) {
            return state.clone();
        }

        self.imports
            .write()
            .entry(id.clone())
            .or_default()
            .clone()
    }

    #[cfg(test)]
    fn tracked_imports(&self) -> usize {
        self.imports.read().len()
    }
}
