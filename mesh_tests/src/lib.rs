//! Shared fixtures for the integration tests.

use std::{sync::Arc, time::Duration};

use mesh_peer::PeerNode;
use mesh_registry::{Registry, RegistryServer};
use mesh_shared::{config::NodeConfig, net::PeerAddress};

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Polls `cond` every 10 ms for up to five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Starts a registry on an ephemeral port. Returns its address and a handle
/// to the live peer set.
pub async fn spawn_registry() -> anyhow::Result<(PeerAddress, Arc<Registry>)> {
    let server = RegistryServer::bind_ephemeral().await?;
    let addr = PeerAddress::from(server.local_addr()?);
    let registry = server.registry();
    tokio::spawn(server.run());
    Ok((addr, registry))
}

/// Node config bound to an ephemeral localhost port with short timeouts.
pub fn node_config(id: &str, registry: &PeerAddress) -> NodeConfig {
    NodeConfig {
        node_id: Some(id.to_string()),
        bind_addr: "127.0.0.1:0".to_string(),
        registry_addr: registry.to_string(),
        grace_period_ms: 200,
        registry_retries: 2,
        registry_retry_delay_ms: 20,
        connect_timeout_ms: 500,
        ..NodeConfig::default()
    }
}

/// Starts a node that uses the registry at `registry`.
pub async fn start_node(id: &str, registry: &PeerAddress) -> anyhow::Result<PeerNode> {
    PeerNode::start(node_config(id, registry)).await
}

/// An address nothing listens on.
pub async fn dead_address() -> anyhow::Result<PeerAddress> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = PeerAddress::from(listener.local_addr()?);
    drop(listener);
    Ok(addr)
}
