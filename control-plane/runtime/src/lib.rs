#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_control_plane_core as core;
pub use mesh_control_plane_index as index;

mod admin;
pub mod api;
mod args;
pub mod heartbeat;
pub mod manager;
pub mod metrics;
pub mod peer;
pub mod pods;
pub mod resources;
mod server;
pub mod tls;
pub mod token;

pub use self::args::Args;
