use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver};
use std::thread;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Chat(String),
    Spawn(u32),
    Destroy(u32),
    Peers,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Command::Chat(line.to_string()));
        };

        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next().map(str::parse::<u32>)) {
            (Some("quit"), _) => Some(Command::Quit),
            (Some("peers"), _) => Some(Command::Peers),
            (Some("spawn"), Some(Ok(prefab))) => Some(Command::Spawn(prefab)),
            (Some("destroy"), Some(Ok(instance))) => Some(Command::Destroy(instance)),
            _ => None,
        }
    }
}

/// Reads stdin on its own thread so the tick loop never blocks.
pub fn spawn_reader() -> Receiver<Command> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match Command::parse(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        return;
                    }
                }
                None => eprintln!("commands: /peers, /spawn <prefab>, /destroy <id>, /quit"),
            }
        }
        let _ = tx.send(Command::Quit);
    });
    rx
}
