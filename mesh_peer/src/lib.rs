//! `mesh_peer`
//!
//! Peer node systems:
//! - Connection manager (accept + dial, deduplicated link table, read loops)
//! - Discovery through the rendezvous registry or a static peer list
//! - Local state changes turned into broadcasts
//!
//! Networking model:
//! - TCP mesh, one link per remote address
//! - Length-prefixed JSON frames on every link

pub mod connection;
pub mod discovery;
pub mod node;

pub use connection::ConnectionManager;
pub use node::PeerNode;
