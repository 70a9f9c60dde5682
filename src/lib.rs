//! clusterd library: lifecycle management for a member of a
//! consensus-backed cluster.
//!
//! The [`manager::Manager`] owns a node's consensus layer, RPC service and
//! transport, and HTTP router and transport. It builds and starts them in
//! dependency order, either founds a new cluster or joins an existing one
//! through a peer, and tears everything down in reverse on shutdown.

pub mod cluster;
pub mod config;
pub mod errors;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod net;
pub mod rpc;

pub use errors::{ConfigError, ManagerError, RpcError, StopError};
pub use manager::{
    DefaultFactory, JoinOutcome, LifecycleState, Manager, ManagerOptions, Subsystem,
    SubsystemFactory,
};
