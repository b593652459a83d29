use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::error::SessionError;
use super::events::{ClientEvent, DisconnectReason};
use crate::net::{
    DEFAULT_TICK_RATE, Endpoint, EndpointEvent, Envelope, InstanceId, NetConfig, NetworkStats,
    PacketLossSimulation, Payload, PeerId, PeerInfo, Priority, SERVER_PEER_ID, SpawnInfo,
    Transform,
};
use crate::replication::{PrefabFactory, ReplicationEngine};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub tick_rate: u32,
    pub packet_loss: Option<PacketLossSimulation>,
    pub net: NetConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            packet_loss: None,
            net: NetConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Handshake sent, no answer yet.
    Connecting,
    /// Waiting in a matchmaker queue.
    Admitted,
    /// Handshake sent to the server the matchmaker picked.
    Redirected,
    InSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Server,
    Matchmaker,
}

/// A player's end of a session: talks to a matchmaker or straight to a
/// dedicated server and mirrors the replicated objects it announces.
pub struct SessionClient {
    endpoint: Endpoint,
    replication: ReplicationEngine,
    config: ClientConfig,
    state: ClientState,
    target: Target,
    remote: Option<SocketAddr>,
    name: String,
    peer_id: Option<PeerId>,
    peers: BTreeMap<PeerId, PeerInfo>,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    pending_events: VecDeque<ClientEvent>,
}

impl SessionClient {
    pub fn new<F: PrefabFactory + 'static>(
        bind_addr: &str,
        config: ClientConfig,
        factory: F,
    ) -> Result<Self, SessionError> {
        let mut endpoint = Endpoint::bind(bind_addr, config.net.clone())?;
        if let Some(sim) = &config.packet_loss {
            endpoint.set_packet_loss_sim(sim.clone());
        }
        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64);

        Ok(Self {
            endpoint,
            replication: ReplicationEngine::new(factory),
            config,
            state: ClientState::Disconnected,
            target: Target::Server,
            remote: None,
            name: String::new(),
            peer_id: None,
            peers: BTreeMap::new(),
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            pending_events: VecDeque::new(),
        })
    }

    /// Joins a dedicated server directly.
    pub fn connect(&mut self, server: SocketAddr, name: &str) -> Result<(), SessionError> {
        self.begin(server, name, Target::Server)
    }

    /// Queues at a matchmaker, which later redirects us to a server.
    pub fn join_matchmaker(
        &mut self,
        matchmaker: SocketAddr,
        name: &str,
    ) -> Result<(), SessionError> {
        self.begin(matchmaker, name, Target::Matchmaker)
    }

    fn begin(&mut self, addr: SocketAddr, name: &str, target: Target) -> Result<(), SessionError> {
        if !self.endpoint.is_open() {
            return Err(SessionError::ShutDown);
        }
        if self.state != ClientState::Disconnected {
            self.disconnect();
        }

        self.name = name.to_string();
        self.target = target;
        self.remote = Some(addr);
        self.state = ClientState::Connecting;
        self.endpoint.track(addr);
        self.endpoint.send_reliable(
            Payload::Handshake {
                name: self.name.clone(),
            },
            Some(addr),
        )?;
        log::info!("connecting to {} as {}", addr, self.name);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_in_session(&self) -> bool {
        self.state == ClientState::InSession
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    pub fn peer_name(&self, peer_id: PeerId) -> Option<&str> {
        if peer_id == SERVER_PEER_ID {
            return Some("server");
        }
        self.peers.get(&peer_id).map(|p| p.name.as_str())
    }

    pub fn replication(&self) -> &ReplicationEngine {
        &self.replication
    }

    pub fn replication_mut(&mut self) -> &mut ReplicationEngine {
        &mut self.replication
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> &NetworkStats {
        self.endpoint.stats()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Runs as many fixed ticks as real time allows.
    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.update(self.tick_duration.as_secs_f32());
        }
    }

    /// One tick of `dt` seconds: network, then our own replicas.
    pub fn update(&mut self, dt: f32) {
        if !self.endpoint.is_open() {
            return;
        }

        for event in self.endpoint.poll(dt) {
            match event {
                EndpointEvent::Message { from, envelope } => {
                    if Some(from) == self.remote {
                        self.handle_message(from, envelope);
                    } else {
                        log::debug!("ignoring {:?} from {}", envelope.message_type(), from);
                    }
                }
                EndpointEvent::TimedOut(addr) => {
                    if Some(addr) == self.remote {
                        log::warn!("{} stopped answering", addr);
                        self.teardown(DisconnectReason::Timeout);
                    }
                }
                EndpointEvent::Acknowledged { .. } => {}
            }
        }

        self.push_replicas();
    }

    fn push_replicas(&mut self) {
        let (Some(peer_id), Some(remote)) = (self.peer_id, self.remote) else {
            return;
        };
        if self.state != ClientState::InSession {
            return;
        }
        for (route, value) in self.replication.collect_updates(peer_id) {
            if let Err(e) = self
                .endpoint
                .send_unordered(Payload::Field { route, value }, Some(remote))
            {
                log::warn!("field update failed: {}", e);
            }
        }
    }

    fn handle_message(&mut self, from: SocketAddr, envelope: Envelope) {
        match envelope.payload {
            Payload::Welcome { peer_id, peers } => self.handle_welcome(peer_id, peers),
            Payload::Redirect { port } => self.handle_redirect(from, port),
            Payload::Error { reason } => {
                log::warn!("{} refused us: {}", from, reason);
                self.pending_events.push_back(ClientEvent::Error { reason });
                self.teardown(DisconnectReason::Rejected);
            }
            Payload::Disconnect { peer_id } if peer_id == SERVER_PEER_ID => {
                self.teardown(DisconnectReason::ServerShutdown);
            }
            Payload::Disconnect { peer_id } => {
                self.peers.remove(&peer_id);
                for instance_id in self.replication.destroy_owned_by(peer_id) {
                    self.pending_events
                        .push_back(ClientEvent::Destroyed { instance_id });
                }
                self.pending_events
                    .push_back(ClientEvent::PeerLeft { peer_id });
            }
            Payload::PeerJoined(info) => {
                self.peers.insert(info.id, info.clone());
                self.pending_events.push_back(ClientEvent::PeerJoined(info));
            }
            Payload::Chat { from, text } => {
                self.pending_events.push_back(ClientEvent::Chat { from, text });
            }
            Payload::Spawn(info) => {
                if self.replication.registry().contains(info.instance_id) {
                    return;
                }
                match self.replication.spawn(info.clone()) {
                    Ok(()) => self.pending_events.push_back(ClientEvent::Spawned(info)),
                    Err(e) => log::warn!("cannot mirror instance {}: {}", info.instance_id, e),
                }
            }
            Payload::Destroy { instance_id } => {
                for instance_id in self.replication.destroy(instance_id) {
                    self.pending_events
                        .push_back(ClientEvent::Destroyed { instance_id });
                }
            }
            Payload::Field { route, value } => {
                let Some(peer_id) = self.peer_id else {
                    return;
                };
                if let Err(e) = self.replication.apply_relayed(peer_id, &route, value) {
                    log::debug!("field update dropped: {}", e);
                }
            }
            Payload::StartMatch => self.pending_events.push_back(ClientEvent::MatchStarted),
            Payload::MatchResult { winner } => {
                self.pending_events
                    .push_back(ClientEvent::MatchResult { winner });
            }
            other => log::debug!("ignoring {:?} from {}", other.message_type(), from),
        }
    }

    fn handle_welcome(&mut self, peer_id: PeerId, peers: Vec<PeerInfo>) {
        match (self.state, self.target) {
            (ClientState::Connecting, Target::Matchmaker) => {
                log::info!("queued at matchmaker as peer {}", peer_id);
                self.peer_id = Some(peer_id);
                self.state = ClientState::Admitted;
                self.pending_events
                    .push_back(ClientEvent::Admitted { peer_id });
            }
            (ClientState::Connecting, Target::Server) | (ClientState::Redirected, _) => {
                log::info!("joined session as peer {}", peer_id);
                self.peer_id = Some(peer_id);
                self.state = ClientState::InSession;
                self.peers = peers.iter().map(|p| (p.id, p.clone())).collect();
                self.pending_events
                    .push_back(ClientEvent::SessionJoined { peer_id, peers });
            }
            (state, _) => log::debug!("unexpected welcome while {:?}", state),
        }
    }

    fn handle_redirect(&mut self, from: SocketAddr, port: u16) {
        if self.state != ClientState::Admitted {
            log::debug!("unexpected redirect while {:?}", self.state);
            return;
        }

        let server = SocketAddr::new(from.ip(), port);
        log::info!("redirected to {}", server);
        self.endpoint.forget(&from);
        self.remote = Some(server);
        self.peer_id = None;
        self.state = ClientState::Redirected;
        self.endpoint.track(server);
        self.pending_events.push_back(ClientEvent::Redirected { port });

        let handshake = Payload::Handshake {
            name: self.name.clone(),
        };
        if let Err(e) = self.endpoint.send_reliable(handshake, Some(server)) {
            log::warn!("handshake to {} failed: {}", server, e);
            self.teardown(DisconnectReason::Rejected);
        }
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        if let Some(remote) = self.remote.take() {
            self.endpoint.forget(&remote);
        }
        self.state = ClientState::Disconnected;
        self.peer_id = None;
        self.peers.clear();
        self.replication.clear();
        log::info!("{}", reason.as_str());
        self.pending_events
            .push_back(ClientEvent::Disconnected { reason });
    }

    fn remote(&self) -> Result<SocketAddr, SessionError> {
        match (self.state, self.remote) {
            (ClientState::InSession, Some(remote)) => Ok(remote),
            _ => Err(SessionError::NotConnected),
        }
    }

    pub fn send_chat(&mut self, text: &str) -> Result<(), SessionError> {
        let from = self.peer_id.unwrap_or(SERVER_PEER_ID);
        self.send_reliable(Payload::Chat {
            from,
            text: text.to_string(),
        })
    }

    /// Asks the server to spawn a prefab owned by us. The object appears
    /// once the server announces it.
    pub fn instantiate(
        &mut self,
        prefab_id: u32,
        transform: Transform,
        parent_id: Option<InstanceId>,
    ) -> Result<(), SessionError> {
        let owner_id = self.peer_id.ok_or(SessionError::NotConnected)?;
        self.send_reliable(Payload::Spawn(SpawnInfo {
            instance_id: 0,
            owner_id,
            prefab_id,
            transform,
            parent_id,
        }))
    }

    pub fn destroy(&mut self, instance_id: InstanceId) -> Result<(), SessionError> {
        self.send_reliable(Payload::Destroy { instance_id })
    }

    pub fn send_reliable(&mut self, payload: Payload) -> Result<(), SessionError> {
        self.send(Priority::RELIABLE | Priority::ORDERED, payload)
    }

    pub fn send_ordered(&mut self, payload: Payload) -> Result<(), SessionError> {
        self.send(Priority::ORDERED, payload)
    }

    pub fn send_unordered(&mut self, payload: Payload) -> Result<(), SessionError> {
        self.send(Priority::empty(), payload)
    }

    fn send(&mut self, priority: Priority, payload: Payload) -> Result<(), SessionError> {
        let remote = self.remote()?;
        self.endpoint.send(priority, payload, Some(remote))?;
        Ok(())
    }

    /// Leaves the current session or queue.
    pub fn disconnect(&mut self) {
        let Some(remote) = self.remote else {
            return;
        };
        let payload = Payload::Disconnect {
            peer_id: self.peer_id.unwrap_or(SERVER_PEER_ID),
        };
        if let Err(e) = self.endpoint.send_unordered(payload, Some(remote)) {
            log::debug!("disconnect notice failed: {}", e);
        }
        self.teardown(DisconnectReason::Graceful);
    }

    /// Disconnects and closes the socket. Later calls do nothing.
    pub fn close(&mut self) {
        if !self.endpoint.is_open() {
            return;
        }
        self.disconnect();
        self.endpoint.close();
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Replicate;

    fn client() -> SessionClient {
        SessionClient::new(
            "127.0.0.1:0",
            ClientConfig::default(),
            |_: u32, _: &Transform| -> Option<Box<dyn Replicate>> { None },
        )
        .unwrap()
    }

    #[test]
    fn test_sends_require_a_session() {
        let mut client = client();
        assert!(matches!(
            client.send_chat("hi"),
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            client.instantiate(1, Transform::default(), None),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn test_connect_tracks_remote_until_disconnect() {
        let mut client = client();
        let server: SocketAddr = "127.0.0.1:9".parse().unwrap();
        client.connect(server, "Alice").unwrap();
        assert_eq!(client.state(), ClientState::Connecting);
        assert!(client.endpoint().is_tracked(&server));
        assert_eq!(client.endpoint().pending_reliable(&server), 1);

        client.disconnect();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.endpoint().has_state_for(&server));
        let events: Vec<_> = client.drain_events().collect();
        assert_eq!(
            events,
            vec![ClientEvent::Disconnected {
                reason: DisconnectReason::Graceful
            }]
        );
    }

    #[test]
    fn test_unanswered_handshake_times_out() {
        let mut client = client();
        let server: SocketAddr = "127.0.0.1:9".parse().unwrap();
        client.connect(server, "Alice").unwrap();

        for _ in 0..60 {
            client.update(0.1);
        }
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.drain_events().any(|e| e
            == ClientEvent::Disconnected {
                reason: DisconnectReason::Timeout
            }));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut client = client();
        client.close();
        client.close();
        assert!(!client.endpoint().is_open());
        assert!(matches!(
            client.connect("127.0.0.1:9".parse().unwrap(), "Alice"),
            Err(SessionError::ShutDown)
        ));
    }
}
