use std::net::SocketAddr;

use crate::net::{InstanceId, PeerId, PeerInfo, SpawnInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    Rejected,
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Rejected => "rejected",
            DisconnectReason::ServerShutdown => "server shut down",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PeerConnected {
        peer_id: PeerId,
        name: String,
        addr: SocketAddr,
    },
    PeerDisconnected {
        peer_id: PeerId,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    Chat {
        from: PeerId,
        text: String,
    },
    Spawned(SpawnInfo),
    Destroyed {
        instance_id: InstanceId,
    },
    MatchStarted,
    MatchEnded {
        winner: PeerId,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Welcomed by a matchmaker; waiting for a server.
    Admitted {
        peer_id: PeerId,
    },
    /// The matchmaker moved us to the server on `port`.
    Redirected {
        port: u16,
    },
    /// Welcomed by a game server.
    SessionJoined {
        peer_id: PeerId,
        peers: Vec<PeerInfo>,
    },
    PeerJoined(PeerInfo),
    PeerLeft {
        peer_id: PeerId,
    },
    Chat {
        from: PeerId,
        text: String,
    },
    Spawned(SpawnInfo),
    Destroyed {
        instance_id: InstanceId,
    },
    MatchStarted,
    MatchResult {
        winner: PeerId,
    },
    Error {
        reason: String,
    },
    Disconnected {
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchmakerEvent {
    PeerAdmitted {
        peer_id: PeerId,
        name: String,
    },
    PeerRejected {
        addr: SocketAddr,
        reason: String,
    },
    PeerLeft {
        peer_id: PeerId,
        reason: DisconnectReason,
    },
    ServerLaunched {
        port: u16,
        peers: Vec<PeerId>,
    },
    ServerReady {
        port: u16,
    },
    PeerRedirected {
        peer_id: PeerId,
        port: u16,
    },
    LaunchFailed {
        port: u16,
        message: String,
    },
    SessionClosed {
        port: u16,
    },
}
