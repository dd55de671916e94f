//! `mesh_shared`
//!
//! Libraries shared by the registry and peer nodes.
//!
//! Design goals:
//! - One wire format (length-prefixed JSON) for registry and peer links.
//! - Owned, lock-guarded state instead of process globals.
//! - Locks are never held across network I/O.
//! - No `unsafe`.

pub mod config;
pub mod error;
pub mod math;
pub mod net;
pub mod protocol;
pub mod sim;
pub mod state;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::protocol::*;
    pub use crate::state::*;
}
