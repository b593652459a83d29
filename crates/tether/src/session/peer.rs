use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::net::{PeerId, PeerInfo};

pub const MAX_NAME_LEN: usize = 16;

/// 1 to 16 characters, ASCII letters, digits or underscore.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Names are unique regardless of case.
pub fn names_collide(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Why a handshake was refused. The string form travels in `Error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidName,
    ServerFull,
    MatchInProgress,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::InvalidName => "Invalid User Name",
            Rejection::ServerFull => "Server Full",
            Rejection::MatchInProgress => "Match In Progress",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub name: String,
    pub connected_at: Instant,
}

impl Peer {
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// Admitted peers, addressable by id or by socket address.
#[derive(Debug)]
pub struct PeerTable {
    peers_by_addr: HashMap<SocketAddr, PeerId>,
    peers: HashMap<PeerId, Peer>,
    next_peer_id: PeerId,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers_by_addr: HashMap::new(),
            peers: HashMap::new(),
            next_peer_id: 1,
            max_peers,
        }
    }

    /// Validates the name and registers a new peer. A handshake repeated from
    /// an admitted address returns the existing peer.
    pub fn admit(&mut self, addr: SocketAddr, name: &str) -> Result<&Peer, Rejection> {
        if let Some(&id) = self.peers_by_addr.get(&addr) {
            return match self.peers.get(&id) {
                Some(peer) if peer.name == name => Ok(peer),
                _ => Err(Rejection::InvalidName),
            };
        }

        if !is_valid_name(name) || self.has_name(name) {
            return Err(Rejection::InvalidName);
        }
        if self.is_full() {
            return Err(Rejection::ServerFull);
        }

        let id = self.next_peer_id;
        self.next_peer_id += 1;

        self.peers_by_addr.insert(addr, id);
        let peer = self.peers.entry(id).or_insert(Peer {
            id,
            addr,
            name: name.to_string(),
            connected_at: Instant::now(),
        });
        Ok(peer)
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&Peer> {
        self.peers_by_addr
            .get(addr)
            .and_then(|id| self.peers.get(id))
    }

    pub fn id_of(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.peers_by_addr.get(addr).copied()
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;
        self.peers_by_addr.remove(&peer.addr);
        Some(peer)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.peers.values().any(|p| names_collide(&p.name, name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peer infos sorted by id.
    pub fn infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.values().map(Peer::info).collect();
        infos.sort_by_key(|p| p.id);
        infos
    }

    pub fn names(&self) -> Vec<String> {
        self.infos().into_iter().map(|p| p.name).collect()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.peers_by_addr.keys().copied().collect()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_name_rules() {
        assert!(is_valid_name("Alice"));
        assert!(is_valid_name("player_1"));
        assert!(is_valid_name("abcdefghijklmnop"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("abcdefghijklmnopq"));
        assert!(!is_valid_name("bad name"));
        assert!(!is_valid_name("émile"));
        assert!(names_collide("ALICE", "alice"));
    }

    #[test]
    fn test_admit_assigns_ids_from_one() {
        let mut table = PeerTable::new(4);
        assert_eq!(table.admit(addr(1), "Alice").unwrap().id, 1);
        assert_eq!(table.admit(addr(2), "Bob").unwrap().id, 2);
        assert_eq!(table.id_of(&addr(2)), Some(2));
        assert_eq!(table.names(), vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_duplicate_name_rejected_case_insensitively() {
        let mut table = PeerTable::new(4);
        table.admit(addr(1), "Alice").unwrap();
        assert_eq!(table.admit(addr(2), "alice").unwrap_err(), Rejection::InvalidName);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_rejects() {
        let mut table = PeerTable::new(1);
        table.admit(addr(1), "Alice").unwrap();
        assert_eq!(table.admit(addr(2), "Bob").unwrap_err(), Rejection::ServerFull);
    }

    #[test]
    fn test_repeated_handshake_is_idempotent() {
        let mut table = PeerTable::new(4);
        let id = table.admit(addr(1), "Alice").unwrap().id;
        assert_eq!(table.admit(addr(1), "Alice").unwrap().id, id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_frees_name() {
        let mut table = PeerTable::new(4);
        let id = table.admit(addr(1), "Alice").unwrap().id;
        assert!(table.remove(id).is_some());
        assert!(table.get_by_addr(&addr(1)).is_none());
        assert!(table.admit(addr(2), "ALICE").is_ok());
    }

    #[test]
    fn test_rejection_strings() {
        assert_eq!(Rejection::InvalidName.as_str(), "Invalid User Name");
        assert_eq!(Rejection::ServerFull.to_string(), "Server Full");
        assert_eq!(Rejection::MatchInProgress.as_str(), "Match In Progress");
    }
}
