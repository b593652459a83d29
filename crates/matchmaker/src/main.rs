use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use tether::{Matchmaker, MatchmakerConfig, MatchmakerEvent, ProcessLauncher};

#[derive(Parser)]
#[command(name = "tether-matchmaker")]
#[command(about = "Groups waiting players and launches a server for each match")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_MATCHMAKER_PORT)]
    port: u16,

    #[arg(short, long, help = "TOML file with matchmaker settings")]
    config: Option<PathBuf>,

    #[arg(long, help = "Players per match")]
    min_players: Option<usize>,

    #[arg(long, help = "First port handed to launched servers")]
    port_start: Option<u16>,

    #[arg(long, help = "Last port handed to launched servers")]
    port_end: Option<u16>,

    #[arg(long, help = "Server binary; defaults to tether-server next to this one")]
    server_bin: Option<PathBuf>,

    #[arg(long = "server-arg", help = "Extra argument passed to every launched server")]
    server_args: Vec<String>,
}

fn load_config(path: &PathBuf) -> Result<MatchmakerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => MatchmakerConfig::default(),
    };
    if let Some(min_players) = args.min_players {
        config.min_players = min_players;
    }
    if let Some(start) = args.port_start {
        config.server_port_start = start;
    }
    if let Some(end) = args.port_end {
        config.server_port_end = end;
    }

    let launcher = match args.server_bin {
        Some(program) => ProcessLauncher::new(program),
        None => ProcessLauncher::sibling("tether-server"),
    }
    .with_args(args.server_args);
    log::info!("launching servers with {}", launcher.program().display());

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let mut matchmaker = Matchmaker::new(&bind_addr, config, launcher)?;
    log::info!("Matchmaker listening on {}", matchmaker.local_addr());

    let running = matchmaker.running();
    while running.load(Ordering::SeqCst) {
        matchmaker.tick_once();
        for event in matchmaker.drain_events() {
            match event {
                MatchmakerEvent::LaunchFailed { port, message } => {
                    log::error!("server on port {} failed: {}", port, message);
                }
                MatchmakerEvent::PeerRejected { addr, reason } => {
                    log::warn!("Connection denied to {}: {}", addr, reason);
                }
                other => log::debug!("{:?}", other),
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    matchmaker.shutdown();
    Ok(())
}
