mod console;

use std::net::SocketAddr;
use std::sync::mpsc::TryRecvError;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;

use console::Command;
use tether::session::is_valid_name;
use tether::{
    ClientConfig, ClientEvent, DynamicObject, Replicate, SessionClient, SessionError, Transform,
};

#[derive(Parser)]
#[command(name = "tether-client")]
#[command(about = "Headless session client with a chat console")]
struct Args {
    #[arg(short, long, help = "Player name, 1-16 letters, digits or underscores")]
    name: String,

    #[arg(
        short,
        long,
        help = "Matchmaker address to queue at (e.g., 127.0.0.1:27000)"
    )]
    matchmaker: Option<SocketAddr>,

    #[arg(short, long, help = "Server address to join directly")]
    server: Option<SocketAddr>,

    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,
}

fn mirror_prefab(_prefab_id: u32, _transform: &Transform) -> Option<Box<dyn Replicate>> {
    Some(Box::new(DynamicObject::new()))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !is_valid_name(&args.name) {
        return Err(SessionError::InvalidName(args.name).into());
    }

    let mut client = SessionClient::new(&args.bind, ClientConfig::default(), mirror_prefab)?;
    match (args.server, args.matchmaker) {
        (Some(server), _) => client.connect(server, &args.name)?,
        (None, Some(matchmaker)) => client.join_matchmaker(matchmaker, &args.name)?,
        (None, None) => {
            let matchmaker = SocketAddr::from(([127, 0, 0, 1], tether::DEFAULT_MATCHMAKER_PORT));
            client.join_matchmaker(matchmaker, &args.name)?;
        }
    }

    let commands = console::spawn_reader();
    loop {
        client.tick_once();

        let events: Vec<ClientEvent> = client.drain_events().collect();
        for event in events {
            if let ClientEvent::Disconnected { reason } = event {
                println!("* {}", reason.as_str());
                client.close();
                return Ok(());
            }
            print_event(&client, event);
        }

        match commands.try_recv() {
            Ok(Command::Quit) | Err(TryRecvError::Disconnected) => break,
            Ok(command) => {
                if let Err(e) = run_command(&mut client, command) {
                    println!("* {}", e);
                }
            }
            Err(TryRecvError::Empty) => {}
        }

        thread::sleep(Duration::from_millis(1));
    }

    client.close();
    Ok(())
}

fn run_command(client: &mut SessionClient, command: Command) -> Result<()> {
    if !client.is_in_session() {
        bail!("not in a session yet");
    }
    match command {
        Command::Chat(text) => client.send_chat(&text)?,
        Command::Spawn(prefab) => client.instantiate(prefab, Transform::default(), None)?,
        Command::Destroy(instance) => client.destroy(instance)?,
        Command::Peers => {
            for peer in client.peers() {
                println!("  {} {}", peer.id, peer.name);
            }
        }
        Command::Quit => {}
    }
    Ok(())
}

fn print_event(client: &SessionClient, event: ClientEvent) {
    let name = |id| client.peer_name(id).unwrap_or("?").to_string();
    match event {
        ClientEvent::Admitted { peer_id } => {
            println!("* queued as peer {}, waiting for a match", peer_id)
        }
        ClientEvent::Redirected { port } => println!("* moving to server on port {}", port),
        ClientEvent::SessionJoined { peer_id, peers } => {
            let names: Vec<&str> = peers.iter().map(|p| p.name.as_str()).collect();
            println!("* joined as peer {} with {}", peer_id, names.join(", "));
        }
        ClientEvent::PeerJoined(info) => println!("* {} joined", info.name),
        ClientEvent::PeerLeft { peer_id } => println!("* peer {} left", peer_id),
        ClientEvent::Chat { from, text } => println!("<{}> {}", name(from), text),
        ClientEvent::MatchStarted => println!("* match started"),
        ClientEvent::MatchResult { winner } => println!("* {} wins", name(winner)),
        ClientEvent::Error { reason } => println!("* error: {}", reason),
        ClientEvent::Spawned(info) => log::debug!(
            "instance {} (prefab {}) owned by {}",
            info.instance_id,
            info.prefab_id,
            info.owner_id
        ),
        ClientEvent::Destroyed { instance_id } => log::debug!("instance {} gone", instance_id),
        ClientEvent::Disconnected { reason } => println!("* {}", reason.as_str()),
    }
}
