//! Headless peer binary.
//!
//! Usage:
//!   cargo run -p mesh_peer -- [--config node.json] [--id p1] [--bind 0.0.0.0:9001]
//!       [--advertise 192.168.0.101:9001] [--registry 192.168.0.10:5000]
//!       [--peer host:port]... [--lan] [--tick-hz 60] [--grace-ms 3000]
//!
//! Passing `--peer` one or more times skips the registry. `--lan` finds
//! peers by UDP broadcast instead.
//!
//! Console commands:
//!   w / a / s / d   - Move one frame up / left / down / right
//!   fire            - Shoot along the facing direction
//!   say <text>      - Send a chat line to every peer
//!   status          - Show local entity, links and projectiles
//!   peers           - List live links
//!   quit            - Deregister and exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use mesh_peer::PeerNode;
use mesh_shared::{config::NodeConfig, sim::InputState};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<NodeConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = NodeConfig::default();

    // The config file is the base layer; flags override it regardless of order.
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        let path = args.get(pos + 1).context("--config needs a path")?;
        cfg = NodeConfig::from_file(path)?;
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--id" if i + 1 < args.len() => {
                cfg.node_id = Some(args[i + 1].clone());
                i += 2;
            }
            "--bind" if i + 1 < args.len() => {
                cfg.bind_addr = args[i + 1].clone();
                i += 2;
            }
            "--advertise" if i + 1 < args.len() => {
                cfg.advertise_addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--registry" if i + 1 < args.len() => {
                cfg.registry_addr = args[i + 1].clone();
                i += 2;
            }
            "--peer" if i + 1 < args.len() => {
                cfg.static_peers.push(args[i + 1].clone());
                i += 2;
            }
            "--lan" => {
                cfg.lan_discovery = true;
                i += 1;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(cfg.tick_hz);
                i += 2;
            }
            "--grace-ms" if i + 1 < args.len() => {
                cfg.grace_period_ms = args[i + 1].parse().unwrap_or(cfg.grace_period_ms);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

/// Console line → one frame of input, or a command handled by the loop.
enum Command {
    Input(InputState),
    Say(String),
    Status,
    Peers,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    let input = |dx: f64, dy: f64| {
        Command::Input(InputState {
            dx,
            dy,
            fire: false,
        })
    };
    if let Some(text) = line.strip_prefix("say ") {
        return Command::Say(text.trim().to_string());
    }
    match line {
        "w" => input(0.0, -1.0),
        "a" => input(-1.0, 0.0),
        "s" => input(0.0, 1.0),
        "d" => input(1.0, 0.0),
        "fire" | "f" => Command::Input(InputState {
            fire: true,
            ..Default::default()
        }),
        "status" => Command::Status,
        "peers" => Command::Peers,
        "quit" | "exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

fn print_status(node: &PeerNode) {
    match node.store().entity(node.local_id()) {
        Some(me) => println!(
            "{} at ({:.1}, {:.1}) angle={:.2} health={} eliminated={}",
            me.id, me.position.x, me.position.y, me.angle, me.health, me.eliminated
        ),
        None => println!("{} has been removed", node.local_id()),
    }
    println!("Links: {}", node.manager().len());
    for e in node.store().entities() {
        if e.id != node.local_id() {
            println!(
                "  {} at ({:.1}, {:.1}) health={} eliminated={}",
                e.id, e.position.x, e.position.y, e.health, e.eliminated
            );
        }
    }
    println!("Projectiles in flight: {}", node.store().projectiles().len());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        id = cfg.node_id.as_deref().unwrap_or("<from address>"),
        bind = %cfg.bind_addr,
        registry = %cfg.registry_addr,
        static_peers = cfg.static_peers.len(),
        "Starting peer"
    );

    let node = PeerNode::start(cfg).await.context("start peer node")?;

    // Registry contact and dialing run beside the frame loop.
    let joiner = node.clone();
    tokio::spawn(async move {
        joiner.join().await;
    });

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Peer ready. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut ticker = tokio::time::interval(node.config().frame_interval());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut input = InputState::default();
                while let Ok(line) = console_rx.try_recv() {
                    match parse_command(&line) {
                        Command::Input(i) => input = input.merge(i),
                        Command::Say(text) => {
                            node.say(&text).await;
                        }
                        Command::Status => print_status(&node),
                        Command::Peers => {
                            for peer in node.manager().peers() {
                                println!("  {peer}");
                            }
                        }
                        Command::Quit => {
                            node.leave().await;
                            return Ok(());
                        }
                        Command::Unknown(other) => println!("Unknown command: {other}"),
                    }
                }
                node.frame(input).await;
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, leaving mesh");
                node.leave().await;
                return Ok(());
            }
        }
    }
}
