//! Peer node.
//!
//! Wires the state store, the connection manager, and discovery together:
//! 1. Bind the listening socket (the only fatal failure)
//! 2. Spawn the local entity
//! 3. `join`: announce to the registry, fetch peers, dial each one. Nodes
//!    that accept our links greet us with their own position.
//! 4. Every frame: step local input, broadcast changes, advance projectiles
//! 5. `leave`: best-effort deregister, close every link

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use mesh_shared::{
    config::NodeConfig,
    net::{bind_listener, PeerAddress},
    protocol::Message,
    sim::{InputState, LocalController, LocalEvent},
    state::{DamageOutcome, Hit, StateStore},
};
use tracing::{info, warn};

use crate::{
    connection::{ConnectOutcome, ConnectionManager, LinkOptions},
    discovery::{without_self, Discovery, LanDiscovery, RegistryClient, StaticPeers},
};

/// One running peer. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct PeerNode {
    cfg: NodeConfig,
    store: StateStore,
    manager: ConnectionManager,
    discovery: Arc<dyn Discovery>,
    controller: LocalController,
    local_addr: SocketAddr,
}

impl PeerNode {
    /// Binds the listener and spawns the local entity. Discovery is picked
    /// from the config: a non-empty static list wins, then LAN broadcast,
    /// then the registry.
    pub async fn start(cfg: NodeConfig) -> anyhow::Result<Self> {
        let discovery: Arc<dyn Discovery> = if !cfg.static_peers.is_empty() {
            Arc::new(StaticPeers::new(
                cfg.static_peers.iter().cloned().map(PeerAddress::new).collect(),
            ))
        } else if cfg.lan_discovery {
            Arc::new(
                LanDiscovery::from_config(&cfg)
                    .await
                    .context("start LAN discovery")?,
            )
        } else {
            Arc::new(RegistryClient::from_config(&cfg))
        };
        Self::start_with(cfg, discovery).await
    }

    /// Like [`Self::start`] with an explicit discovery source.
    pub async fn start_with(cfg: NodeConfig, discovery: Arc<dyn Discovery>) -> anyhow::Result<Self> {
        let listener = bind_listener(&cfg.bind_addr)
            .await
            .context("bind peer listener")?;
        let local_addr = listener.local_addr().context("peer local_addr")?;
        // Without an explicit advertise address, announce what was actually
        // bound (this resolves port 0).
        let self_addr = match cfg.advertise_addr {
            Some(_) => cfg.self_addr(),
            None => PeerAddress::from(local_addr),
        };

        let store = StateStore::new(cfg.grace_period());
        let manager = ConnectionManager::new(
            self_addr.clone(),
            store.clone(),
            LinkOptions {
                connect_timeout: cfg.connect_timeout(),
                max_connections: cfg.max_connections,
            },
        );

        let controller = LocalController::new(cfg.entity_id(&self_addr));
        store.spawn_local(controller.id());

        // Nodes that dial us get our position right away.
        let greet_store = store.clone();
        let greet_id = controller.id().to_string();
        manager.set_greeting(move || {
            let me = greet_store.entity(&greet_id).filter(|e| !e.eliminated)?;
            Some(
                LocalEvent::Moved {
                    id: me.id,
                    position: me.position,
                    angle: me.angle,
                }
                .to_message(),
            )
        });
        manager.serve(listener);

        info!(
            id = %controller.id(),
            %local_addr,
            advertise = %self_addr,
            "Peer node started"
        );
        Ok(Self {
            cfg,
            store,
            manager,
            discovery,
            controller,
            local_addr,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn self_addr(&self) -> &PeerAddress {
        self.manager.self_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_id(&self) -> &str {
        self.controller.id()
    }

    /// Announces this node, fetches the peer list, and dials every peer.
    /// Registry failures degrade to an empty peer list. Returns the number of
    /// new links.
    pub async fn join(&self) -> usize {
        let me = self.self_addr().clone();
        if let Err(e) = self.discovery.announce(&me).await {
            warn!(error = %e, "Announce failed, continuing without registration");
        }
        let peers = match self.discovery.peers().await {
            Ok(peers) => without_self(peers, &me),
            Err(e) => {
                warn!(error = %e, "No peer list, starting alone");
                Vec::new()
            }
        };

        let mut connected = 0;
        for peer in &peers {
            match self.manager.connect(peer).await {
                Ok(ConnectOutcome::Connected) => connected += 1,
                Ok(outcome) => info!(%peer, ?outcome, "Skipped dial"),
                Err(e) => warn!(%peer, error = %e, "Could not reach peer"),
            }
        }
        info!(discovered = peers.len(), connected, "Joined mesh");

        // Tell the newly linked peers where we are.
        if connected > 0 {
            if let Some(me) = self.store.entity(self.local_id()) {
                self.local_state_changed(LocalEvent::Moved {
                    id: me.id,
                    position: me.position,
                    angle: me.angle,
                })
                .await;
            }
        }
        connected
    }

    /// Hook for the input layer: broadcasts one local change. Returns the
    /// number of peers written to.
    pub async fn local_state_changed(&self, event: LocalEvent) -> usize {
        match self.manager.broadcast(&event.to_message()).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Broadcast failed");
                0
            }
        }
    }

    /// Sends a chat line to every peer.
    pub async fn say(&self, text: &str) -> usize {
        let msg = Message::Chat {
            id: self.local_id().to_string(),
            text: text.to_string(),
        };
        match self.manager.broadcast(&msg).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Chat not sent");
                0
            }
        }
    }

    /// Runs one simulation frame with the given input.
    pub async fn frame(&self, input: InputState) -> Vec<Hit> {
        for event in self.controller.step(&self.store, input) {
            self.local_state_changed(event).await;
        }

        let hits = self.store.advance_projectiles(1.0);
        let local_eliminated = hits
            .iter()
            .any(|h| h.target == self.local_id() && h.outcome == DamageOutcome::Eliminated);
        if local_eliminated {
            info!(id = %self.local_id(), "Local entity eliminated");
            self.local_state_changed(LocalEvent::Eliminated {
                id: self.local_id().to_string(),
            })
            .await;
        }
        hits
    }

    /// Best-effort deregister, then close every link.
    pub async fn leave(&self) {
        let me = self.self_addr().clone();
        if let Err(e) = self.discovery.withdraw(&me).await {
            warn!(error = %e, "Deregister failed");
        }
        self.manager.shutdown();
    }
}
