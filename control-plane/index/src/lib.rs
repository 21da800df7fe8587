//! In-memory state backing cross-peer connection decisions.
//!
//! - [`connectivity::Pdp`] evaluates access policies.
//! - [`lb::LoadBalancer`] picks among an import's remote sources.
//! - [`ports::PortManager`] leases the local ports imports listen on.
//! - [`ControlIndex`] combines the policy decision point and load balancer
//!   with the registry of reachable peers, imports and exports behind the
//!   [`Decider`](mesh_control_plane_core::Decider) boundary.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod connectivity;
mod control;
pub mod lb;
pub mod metrics;
pub mod ports;


pub use self::{
    control::{ControlIndex, RegistrySizes},
    ports::{LeaseError, PortManager},
};
