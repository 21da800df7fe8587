use crate::ResourceId;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy {id} is invalid: {reason}")]
    Invalid { id: ResourceId, reason: String },

    #[error("policy {0} not found")]
    NotFound(ResourceId),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Every source of an import has been tried in this attempt. Callers should
    /// report the import as temporarily unavailable.
    #[error("tried out all {sources} sources")]
    Exhausted { sources: usize },
}
