//! Synchronization protocol.
//!
//! Message schema shared by registry and peer links, plus the dispatch that
//! routes decoded peer messages to [`StateStore`] mutators.
//!
//! There are no sequence numbers or vector clocks: updates from different
//! links interleave arbitrarily and the replicas converge only eventually.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::SyncResult,
    math::Vec2,
    net::{decode_payload, PeerAddress},
    state::{Projectile, StateStore},
};

/// Tagged message envelope. The `type` field selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // ─── Registry link ───
    Register {
        addr: PeerAddress,
    },
    Deregister {
        addr: PeerAddress,
    },
    GetPeers,
    GetPeersResponse {
        peers: Vec<PeerAddress>,
    },

    // ─── Peer link ───
    /// First frame a dialer sends: the address it listens on.
    Hello {
        addr: PeerAddress,
    },
    Move {
        id: String,
        x: f64,
        y: f64,
        angle: f64,
    },
    Bullet {
        owner_id: String,
        x: f64,
        y: f64,
        vx: f64,
        vy: f64,
    },
    Eliminate {
        id: String,
    },
    /// Free text from the console. `data` is accepted for `text`.
    Chat {
        #[serde(default)]
        id: String,
        #[serde(alias = "data")]
        text: String,
    },

    /// Any discriminator this build does not know.
    #[serde(other)]
    Unknown,
}

/// Registry reply as read by clients. Extra fields (such as `type`) are
/// ignored, so a bare `{"peers":[...]}` is accepted too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerAddress>,
}

/// Decodes one frame payload into a [`Message`].
pub fn decode_message(payload: &[u8]) -> SyncResult<Message> {
    decode_payload(payload)
}

/// What dispatch did with a peer-link message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A new entity was created by a `move`.
    Spawned,
    /// State was mutated.
    Applied,
    /// A chat line for the presentation layer. The store is untouched.
    Chat { id: String, text: String },
    /// Valid message with nothing to do on this link.
    Ignored,
}

/// Applies a message received on the peer link from `origin`.
pub fn dispatch_peer_message(store: &StateStore, origin: &PeerAddress, msg: Message) -> Dispatch {
    match msg {
        Message::Move { id, x, y, angle } => {
            if store.upsert_remote(origin, &id, x, y, angle) {
                debug!(%origin, entity = %id, "Entity joined");
                Dispatch::Spawned
            } else {
                Dispatch::Applied
            }
        }
        Message::Bullet {
            owner_id,
            x,
            y,
            vx,
            vy,
        } => {
            store.add_projectile(Projectile::new(
                owner_id,
                Vec2::new(x, y),
                Vec2::new(vx, vy),
            ));
            Dispatch::Applied
        }
        Message::Eliminate { id } => {
            if store.eliminate(&id) {
                Dispatch::Applied
            } else {
                Dispatch::Ignored
            }
        }
        Message::Hello { addr } => {
            debug!(%origin, announced = %addr, "Late hello ignored");
            Dispatch::Ignored
        }
        Message::Chat { id, text } => {
            info!(%origin, from = %id, %text, "Chat");
            Dispatch::Chat { id, text }
        }
        Message::Unknown => {
            debug!(%origin, "Dropping message with unknown type");
            Dispatch::Ignored
        }
        other @ (Message::Register { .. }
        | Message::Deregister { .. }
        | Message::GetPeers
        | Message::GetPeersResponse { .. }) => {
            warn!(%origin, msg = ?other, "Registry message on peer link ignored");
            Dispatch::Ignored
        }
    }
}
