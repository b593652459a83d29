#![allow(dead_code)]

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use tether::session::{ClientConfig, ServerConfig, SessionClient, SessionServer};
use tether::{Replicate, Transform};

/// Simulated seconds per update. Runs faster than wall time so timeouts are
/// reached quickly.
pub const DT: f32 = 0.01;

pub const AVATAR: u32 = 1;

#[derive(Debug, Default)]
pub struct Avatar {
    pub health: i32,
    pub name: String,
    pub score: u32,
    pub inventory: Vec<u32>,
}

tether::impl_replicate!(Avatar {
    1 => health,
    2 => name,
    3 => score,
    4 => inventory,
} server_writable [3]);

pub fn avatars(prefab_id: u32, _transform: &Transform) -> Option<Box<dyn Replicate>> {
    match prefab_id {
        AVATAR => Some(Box::new(Avatar::default())),
        _ => None,
    }
}

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

pub fn server(port: u16, config: ServerConfig) -> SessionServer {
    SessionServer::new(&format!("127.0.0.1:{}", port), config, avatars).unwrap()
}

pub fn client() -> SessionClient {
    client_with(ClientConfig::default())
}

pub fn client_with(config: ClientConfig) -> SessionClient {
    SessionClient::new("127.0.0.1:0", config, avatars).unwrap()
}

/// Calls `step` until it returns true or `timeout_ms` of wall time pass.
pub fn wait_until<F>(timeout_ms: u64, mut step: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if step() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}
