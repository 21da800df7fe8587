//! The connectivity policy decision point.
//!
//! Policies are held in two tiers, privileged and regular, each split into a
//! deny and an allow bucket. A connection is decided by the first bucket holding
//! a matching policy, in this order:
//!
//! 1. privileged deny
//! 2. privileged allow
//! 3. regular deny (policies in the query's namespace only)
//! 4. regular allow (policies in the query's namespace only)
//!
//! Connections matched by no policy are denied.
//!
//! Buckets are unordered. When several policies in one bucket match, which of
//! them is reported in `matched_by` is unspecified; the decision is the same.

use ahash::AHashMap as HashMap;
use mesh_control_plane_core::{
    AccessPolicy, Decision, DestinationDecision, Labels, PolicyAction, PolicyError, ResourceId,
    DEFAULT_DENY,
};
use parking_lot::RwLock;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct Pdp {
    privileged: RwLock<Tier>,
    regular: RwLock<Tier>,
}

#[derive(Debug)]
struct Tier {
    privileged: bool,
    deny: HashMap<ResourceId, AccessPolicy>,
    allow: HashMap<ResourceId, AccessPolicy>,
}

/// The number of policies held in each bucket.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyCounts {
    pub privileged_deny: usize,
    pub privileged_allow: usize,
    pub regular_deny: usize,
    pub regular_allow: usize,
}

// === impl Pdp ===

impl Default for Pdp {
    fn default() -> Self {
        Self {
            privileged: RwLock::new(Tier::new(true)),
            regular: RwLock::new(Tier::new(false)),
        }
    }
}

impl Pdp {
    /// Validates and stores `policy`, replacing any policy with the same name in
    /// its tier.
    pub fn add_or_update_policy(&self, policy: AccessPolicy) -> Result<(), PolicyError> {
        policy.validate()?;
        debug!(
            policy = %policy.id,
            privileged = policy.privileged,
            action = ?policy.action,
            "Storing policy"
        );
        self.tier(policy.privileged).write().insert(policy);
        Ok(())
    }

    pub fn delete_policy(&self, id: &ResourceId, privileged: bool) -> Result<(), PolicyError> {
        if !self.tier(privileged).write().remove(id) {
            return Err(PolicyError::NotFound(id.clone()));
        }
        debug!(policy = %id, privileged, "Deleted policy");
        Ok(())
    }

    /// Decides whether a connection from `src` to `dst` is allowed. Regular
    /// policies are only considered if they belong to `namespace`.
    pub fn decide(&self, src: &Labels, dst: &Labels, namespace: &str) -> DestinationDecision {
        if let Some(decision) = self.privileged.read().decide(src, dst, None) {
            return decision;
        }
        if let Some(decision) = self.regular.read().decide(src, dst, Some(namespace)) {
            return decision;
        }

        trace!(?src, ?dst, "No policy matched");
        DestinationDecision {
            destination: dst.clone(),
            decision: Decision::Deny,
            matched_by: DEFAULT_DENY.to_string(),
            privileged_match: false,
        }
    }

    pub fn counts(&self) -> PolicyCounts {
        let privileged = self.privileged.read();
        let regular = self.regular.read();
        PolicyCounts {
            privileged_deny: privileged.deny.len(),
            privileged_allow: privileged.allow.len(),
            regular_deny: regular.deny.len(),
            regular_allow: regular.allow.len(),
        }
    }

    fn tier(&self, privileged: bool) -> &RwLock<Tier> {
        if privileged {
            &self.privileged
        } else {
            &self.regular
        }
    }
}

// === impl Tier ===

impl Tier {
    fn new(privileged: bool) -> Self {
        Self {
            privileged,
            deny: HashMap::default(),
            allow: HashMap::default(),
        }
    }

    fn insert(&mut self, policy: AccessPolicy) {
        self.remove(&policy.id);
        let bucket = match policy.action {
            PolicyAction::Deny => &mut self.deny,
            PolicyAction::Allow => &mut self.allow,
        };
        bucket.insert(policy.id.clone(), policy);
    }

    fn remove(&mut self, id: &ResourceId) -> bool {
        let denied = self.deny.remove(id).is_some();
        let allowed = self.allow.remove(id).is_some();
        denied || allowed
    }

    fn decide(
        &self,
        src: &Labels,
        dst: &Labels,
        namespace: Option<&str>,
    ) -> Option<DestinationDecision> {
        let in_scope = |p: &&AccessPolicy| namespace.map_or(true, |ns| p.id.namespace == ns);
        let matched = |bucket: &HashMap<ResourceId, AccessPolicy>, decision| {
            bucket
                .values()
                .filter(in_scope)
                .find(|p| p.matches(src, dst))
                .map(|p| DestinationDecision {
                    destination: dst.clone(),
                    decision,
                    matched_by: p.id.to_string(),
                    privileged_match: self.privileged,
                })
        };

        matched(&self.deny, Decision::Deny).or_else(|| matched(&self.allow, Decision::Allow))
    }
}
