//! Error taxonomy.
//!
//! Only [`SyncError::Bind`] is fatal to a node. Everything else is scoped to
//! one message, one dial, or one connection and is logged by the caller.

use std::io;

use thiserror::Error;

use crate::net::PeerAddress;

/// Errors produced by the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Dialing a peer failed. The peer is skipped.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: PeerAddress,
        #[source]
        source: io::Error,
    },

    /// A frame did not hold a valid message. The message is dropped.
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The registry could not be reached after the bounded retry sequence.
    #[error("registry {addr} unavailable after {attempts} attempts")]
    RegistryUnavailable { addr: PeerAddress, attempts: u32 },

    /// A frame header announced more bytes than the codec accepts.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// The local listening socket could not be bound.
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SyncError {
    /// True when the error means the byte stream can no longer be trusted
    /// and the link must be torn down.
    pub fn is_stream_error(&self) -> bool {
        matches!(self, SyncError::Io(_) | SyncError::FrameTooLarge { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
