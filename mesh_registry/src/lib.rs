//! `mesh_registry`
//!
//! Bootstrap rendezvous service:
//! - Holds the set of live peer addresses (process lifetime only)
//! - One request per TCP connection: register, deregister, or get_peers
//! - Never filters the caller out of `get_peers`; callers do that

pub mod registry;

pub use registry::{Registry, RegistryServer};
