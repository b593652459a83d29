mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use config::FileConfig;
use tether::{DynamicObject, PacketLossSimulation, Replicate, ServerEvent, SessionServer, Transform};

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Dedicated session server")]
struct Args {
    #[arg(short, long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    tick_rate: Option<u32>,

    #[arg(short, long)]
    max_peers: Option<usize>,

    #[arg(long, help = "Matchmaker to report readiness to")]
    matchmaker: Option<SocketAddr>,

    #[arg(long, help = "Start the match once this many peers joined")]
    expected_players: Option<usize>,

    #[arg(long, default_value_t = 0.0, help = "Outgoing packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn mirror_prefab(_prefab_id: u32, _transform: &Transform) -> Option<Box<dyn Replicate>> {
    Some(Box::new(DynamicObject::new()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let mut config = file.server;
    if let Some(tick_rate) = args.tick_rate {
        config.tick_rate = tick_rate;
    }
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }
    if args.expected_players.is_some() {
        config.expected_players = args.expected_players;
    }
    if args.matchmaker.is_some() {
        config.matchmaker = args.matchmaker;
        config.shutdown_when_empty = true;
    }
    if args.loss_percent > 0.0 {
        config.packet_loss = Some(PacketLossSimulation::with_loss(args.loss_percent / 100.0));
    }

    let bind = args.bind.or(file.bind).unwrap_or_else(|| "0.0.0.0".to_string());
    let port = args.port.or(file.port).unwrap_or(tether::DEFAULT_PORT);
    let bind_addr = format!("{}:{}", bind, port);

    let mut server = SessionServer::new(&bind_addr, config, mirror_prefab)?;
    log::info!("Server started on {}", server.local_addr());

    let running = server.running();
    while running.load(Ordering::SeqCst) {
        server.tick_once();
        let events: Vec<ServerEvent> = server.drain_events().collect();
        for event in events {
            log_event(&server, event);
        }
        thread::sleep(Duration::from_millis(1));
    }

    server.shutdown();
    log::info!("Server shutting down");
    Ok(())
}

fn log_event(server: &SessionServer, event: ServerEvent) {
    match event {
        ServerEvent::Chat { from, text } => {
            let name = server
                .peers()
                .get(from)
                .map(|p| p.name.as_str())
                .unwrap_or("?");
            log::info!("[chat] {}: {}", name, text);
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            log::warn!("Connection denied to {}: {}", addr, reason);
        }
        ServerEvent::Error { message } => log::error!("{}", message),
        ServerEvent::Spawned(info) => {
            log::debug!(
                "instance {} (prefab {}) owned by {}",
                info.instance_id,
                info.prefab_id,
                info.owner_id
            );
        }
        other => log::debug!("{:?}", other),
    }
}
