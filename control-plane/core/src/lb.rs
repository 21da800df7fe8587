use crate::{Import, ImportSource};
use ahash::AHashSet as HashSet;
use std::{collections::VecDeque, sync::Arc};

/// Load-balancing state for one logical connection, carried across its retries.
#[derive(Clone, Debug)]
pub struct LoadBalancingResult {
    import: Arc<Import>,
    current: Option<usize>,
    failed: HashSet<usize>,
    delayed: VecDeque<usize>,
}

/// Per-connection routing state handed to a [`crate::Decider`].
///
/// Starts empty; the decider fills in load-balancing state on the first outgoing
/// decision and reuses it when the same connection is retried.
#[derive(Clone, Debug, Default)]
pub struct RouteAttempt {
    lb: Option<LoadBalancingResult>,
}

// === impl LoadBalancingResult ===

impl LoadBalancingResult {
    pub fn new(import: Arc<Import>) -> Self {
        Self {
            import,
            current: None,
            failed: HashSet::default(),
            delayed: VecDeque::new(),
        }
    }

    pub fn import(&self) -> &Arc<Import> {
        &self.import
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn set_current(&mut self, index: usize) {
        self.current = Some(index);
    }

    /// The source at the current index, if one is selected.
    pub fn source(&self) -> Option<&ImportSource> {
        self.current.and_then(|i| self.import.sources.get(i))
    }

    pub fn failed(&self) -> &HashSet<usize> {
        &self.failed
    }

    /// Records the current selection, if any, as failed.
    pub fn fail_current(&mut self) {
        if let Some(i) = self.current {
            self.failed.insert(i);
        }
    }

    pub fn pop_delayed(&mut self) -> Option<usize> {
        self.delayed.pop_front()
    }

    /// Defers the current selection: it is retried once every other source has
    /// been tried.
    pub fn delay(&mut self) {
        if let Some(i) = self.current {
            self.delayed.push_back(i);
        }
    }

    /// True when every source has failed in this round, so further selections
    /// can only come from delayed sources.
    pub fn is_delayed(&self) -> bool {
        self.failed.len() >= self.import.sources.len()
    }
}

// === impl RouteAttempt ===

impl RouteAttempt {
    /// Returns the load-balancing state for `import`, creating it on first use.
    pub fn load_balancing(&mut self, import: Arc<Import>) -> &mut LoadBalancingResult {
        self.lb
            .get_or_insert_with(|| LoadBalancingResult::new(import))
    }

    pub fn delay(&mut self) {
        if let Some(lb) = self.lb.as_mut() {
            lb.delay();
        }
    }

    pub fn is_delayed(&self) -> bool {
        self.lb.as_ref().map(|lb| lb.is_delayed()).unwrap_or(false)
    }

    pub fn source(&self) -> Option<&ImportSource> {
        self.lb.as_ref().and_then(|lb| lb.source())
    }
}
