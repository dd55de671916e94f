//! Standalone registry binary.
//!
//! Usage:
//!   cargo run -p mesh_registry -- [--bind 0.0.0.0:5000] [--config registry.json]
//!
//! Peers register their listen address here, ask for the current list, and
//! deregister on shutdown. Nothing is persisted.

use std::env;

use anyhow::Context;
use mesh_registry::RegistryServer;
use mesh_shared::config::RegistryConfig;
use tracing::info;

fn parse_args() -> anyhow::Result<RegistryConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = RegistryConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                let raw = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read config {}", args[i + 1]))?;
                cfg = RegistryConfig::from_json_str(&raw).context("parse registry config")?;
                i += 2;
            }
            "--bind" if i + 1 < args.len() => {
                cfg.bind_addr = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    let server = RegistryServer::bind(&cfg.bind_addr)
        .await
        .context("start registry")?;
    info!(addr = %server.local_addr()?, "Registry listening");

    let registry = server.registry();
    tokio::select! {
        res = server.run() => res?,
        _ = tokio::signal::ctrl_c() => {
            info!(peers = registry.len(), "Registry shutting down");
        }
    }
    Ok(())
}
