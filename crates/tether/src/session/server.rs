use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::error::SessionError;
use super::events::{DisconnectReason, ServerEvent};
use super::peer::{PeerTable, Rejection, is_valid_name};
use crate::net::{
    DEFAULT_TICK_RATE, Endpoint, EndpointEvent, Envelope, InstanceId, NetConfig, NetworkStats,
    PacketLossSimulation, Payload, PeerId, Priority, SERVER_PEER_ID, SpawnInfo, Transform,
};
use crate::replication::{PrefabFactory, ReplicationEngine};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_peers: usize,
    /// The match starts by itself once this many peers joined.
    pub expected_players: Option<usize>,
    /// Coordinator to report readiness and names to.
    pub matchmaker: Option<SocketAddr>,
    pub report_interval_secs: f32,
    /// Stop once the match has started and every peer left.
    pub shutdown_when_empty: bool,
    pub packet_loss: Option<PacketLossSimulation>,
    pub net: NetConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_peers: 8,
            expected_players: None,
            matchmaker: None,
            report_interval_secs: 2.0,
            shutdown_when_empty: false,
            packet_loss: None,
            net: NetConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Lobby,
    InProgress,
    Finished,
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub peer_count: usize,
    pub max_peers: usize,
    pub replica_count: usize,
    pub state: MatchState,
    pub network_stats: NetworkStats,
}

/// Authoritative host of one match.
pub struct SessionServer {
    endpoint: Endpoint,
    peers: PeerTable,
    replication: ReplicationEngine,
    config: ServerConfig,
    state: MatchState,
    report_timer: f32,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    shut_down: bool,
    pending_events: VecDeque<ServerEvent>,
}

impl SessionServer {
    pub fn new<F: PrefabFactory + 'static>(
        bind_addr: &str,
        config: ServerConfig,
        factory: F,
    ) -> Result<Self, SessionError> {
        let mut endpoint = Endpoint::bind(bind_addr, config.net.clone())?;
        if let Some(sim) = &config.packet_loss {
            endpoint.set_packet_loss_sim(sim.clone());
        }
        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64);

        let mut server = Self {
            endpoint,
            peers: PeerTable::new(config.max_peers),
            replication: ReplicationEngine::new(factory),
            state: MatchState::Lobby,
            report_timer: 0.0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            shut_down: false,
            pending_events: VecDeque::new(),
            config,
        };

        if let Some(matchmaker) = server.config.matchmaker {
            let port = server.local_addr().port();
            server.endpoint.track(matchmaker);
            server
                .endpoint
                .send_reliable(Payload::ServerReady { port }, Some(matchmaker))?;
            log::info!("reported ready on port {} to {}", port, matchmaker);
        }

        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
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

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            peer_count: self.peers.len(),
            max_peers: self.config.max_peers,
            replica_count: self.replication.registry().len(),
            state: self.state,
            network_stats: self.endpoint.stats().clone(),
        }
    }

    pub fn run(&mut self) {
        while self.is_running() {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
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

    /// One tick of `dt` seconds: network, replication push, reports.
    pub fn update(&mut self, dt: f32) {
        if self.shut_down {
            return;
        }

        for event in self.endpoint.poll(dt) {
            match event {
                EndpointEvent::Message { from, envelope } => self.handle_message(from, envelope),
                EndpointEvent::TimedOut(addr) => {
                    if let Some(id) = self.peers.id_of(&addr) {
                        self.remove_peer(id, DisconnectReason::Timeout);
                    } else if Some(addr) == self.config.matchmaker {
                        log::warn!("matchmaker {} went silent", addr);
                    }
                }
                EndpointEvent::Acknowledged { .. } => {}
            }
        }

        self.push_replicas();
        self.report(dt);
    }

    fn push_replicas(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        for (route, value) in self.replication.collect_updates(SERVER_PEER_ID) {
            self.broadcast(Priority::empty(), Payload::Field { route, value }, None);
        }
    }

    fn report(&mut self, dt: f32) {
        let Some(matchmaker) = self.config.matchmaker else {
            return;
        };
        self.report_timer += dt;
        if self.report_timer < self.config.report_interval_secs {
            return;
        }
        self.report_timer = 0.0;

        let payload = Payload::NameList {
            port: self.local_addr().port(),
            names: self.peers.names(),
        };
        if let Err(e) = self.endpoint.send_unordered(payload, Some(matchmaker)) {
            log::warn!("name report failed: {}", e);
        }
    }

    fn send_to_peer(&mut self, priority: Priority, payload: Payload, addr: SocketAddr) {
        if let Err(e) = self.endpoint.send(priority, payload, Some(addr)) {
            log::warn!("send to {} failed: {}", addr, e);
        }
    }

    /// Sends to every admitted peer except `except`.
    fn broadcast(&mut self, priority: Priority, payload: Payload, except: Option<PeerId>) {
        let targets: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|p| Some(p.id) != except)
            .map(|p| p.addr)
            .collect();
        for addr in targets {
            self.send_to_peer(priority, payload.clone(), addr);
        }
    }

    fn reliable() -> Priority {
        Priority::RELIABLE | Priority::ORDERED
    }

    fn handle_message(&mut self, from: SocketAddr, envelope: Envelope) {
        if let Payload::Handshake { name } = &envelope.payload {
            let name = name.clone();
            self.handle_handshake(from, &name);
            return;
        }

        let Some(peer_id) = self.peers.id_of(&from) else {
            log::debug!("ignoring {:?} from unknown {}", envelope.message_type(), from);
            return;
        };

        match envelope.payload {
            Payload::Disconnect { .. } => self.remove_peer(peer_id, DisconnectReason::Graceful),
            Payload::Chat { text, .. } => {
                self.broadcast(
                    Self::reliable(),
                    Payload::Chat {
                        from: peer_id,
                        text: text.clone(),
                    },
                    None,
                );
                self.pending_events.push_back(ServerEvent::Chat {
                    from: peer_id,
                    text,
                });
            }
            Payload::Spawn(request) => {
                if let Err(e) = self.spawn_for(
                    peer_id,
                    request.prefab_id,
                    request.transform,
                    request.parent_id,
                ) {
                    log::debug!("spawn request from peer {} refused: {}", peer_id, e);
                    self.pending_events.push_back(ServerEvent::Error {
                        message: format!("spawn request from peer {} refused: {}", peer_id, e),
                    });
                }
            }
            Payload::Destroy { instance_id } => {
                let owner = self
                    .replication
                    .registry()
                    .get(instance_id)
                    .map(|r| r.owner_id);
                if owner == Some(peer_id) {
                    self.destroy(instance_id);
                } else {
                    log::debug!("peer {} may not destroy {}", peer_id, instance_id);
                }
            }
            Payload::Field { route, value } => {
                match self
                    .replication
                    .apply_update(peer_id, SERVER_PEER_ID, &route, value.clone())
                {
                    Ok(()) => self.broadcast(
                        Priority::empty(),
                        Payload::Field { route, value },
                        Some(peer_id),
                    ),
                    Err(e) => log::debug!("field update from peer {} refused: {}", peer_id, e),
                }
            }
            other => log::debug!("ignoring {:?} from peer {}", other.message_type(), peer_id),
        }
    }

    fn admission(&self, name: &str) -> Result<(), Rejection> {
        if !is_valid_name(name) || self.peers.has_name(name) {
            return Err(Rejection::InvalidName);
        }
        if self.peers.is_full() {
            return Err(Rejection::ServerFull);
        }
        if self.state != MatchState::Lobby {
            return Err(Rejection::MatchInProgress);
        }
        Ok(())
    }

    fn handle_handshake(&mut self, from: SocketAddr, name: &str) {
        if self.peers.id_of(&from).is_some() {
            log::debug!("repeated handshake from {}", from);
            return;
        }

        let admitted = self
            .admission(name)
            .and_then(|()| self.peers.admit(from, name).map(|p| p.info()));
        let info = match admitted {
            Ok(info) => info,
            Err(rejection) => return self.reject(from, name, rejection),
        };

        self.endpoint.forget(&from);
        self.endpoint.track(from);

        let welcome = Payload::Welcome {
            peer_id: info.id,
            peers: self.peers.infos(),
        };
        if let Err(e) = self.endpoint.send_reliable(welcome, Some(from)) {
            // The roster no longer fits one datagram.
            log::warn!("welcome to {} failed: {}", from, e);
            self.peers.remove(info.id);
            self.endpoint.forget(&from);
            return self.reject(from, name, Rejection::ServerFull);
        }

        log::info!("peer {} ({}) joined from {}", info.id, info.name, from);
        self.broadcast(Self::reliable(), Payload::PeerJoined(info.clone()), Some(info.id));
        for spawn in self.replication.registry().spawn_infos() {
            self.send_to_peer(Self::reliable(), Payload::Spawn(spawn), from);
        }

        self.pending_events.push_back(ServerEvent::PeerConnected {
            peer_id: info.id,
            name: info.name,
            addr: from,
        });

        if self
            .config
            .expected_players
            .is_some_and(|expected| self.peers.len() >= expected)
        {
            self.start_match();
        }
    }

    fn reject(&mut self, from: SocketAddr, name: &str, rejection: Rejection) {
        log::info!("rejected {} ({}): {}", from, name, rejection);
        self.send_to_peer(
            Self::reliable(),
            Payload::Error {
                reason: rejection.as_str().to_string(),
            },
            from,
        );
        self.endpoint
            .linger(from, self.config.net.disconnect_threshold_secs);
        self.pending_events.push_back(ServerEvent::ConnectionDenied {
            addr: from,
            reason: rejection.as_str().to_string(),
        });
    }

    fn remove_peer(&mut self, peer_id: PeerId, reason: DisconnectReason) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };
        self.endpoint.forget(&peer.addr);
        log::info!("peer {} ({}) {}", peer.id, peer.name, reason.as_str());

        self.broadcast(Self::reliable(), Payload::Disconnect { peer_id }, None);
        self.pending_events
            .push_back(ServerEvent::PeerDisconnected { peer_id, reason });
        for instance_id in self.replication.destroy_owned_by(peer_id) {
            self.pending_events
                .push_back(ServerEvent::Destroyed { instance_id });
        }

        if self.config.shutdown_when_empty
            && self.state != MatchState::Lobby
            && self.peers.is_empty()
        {
            log::info!("match over and no peers left, stopping");
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn spawn_for(
        &mut self,
        owner_id: PeerId,
        prefab_id: u32,
        transform: Transform,
        parent_id: Option<InstanceId>,
    ) -> Result<SpawnInfo, SessionError> {
        let info = self
            .replication
            .instantiate(owner_id, prefab_id, transform, parent_id)?;
        self.broadcast(Self::reliable(), Payload::Spawn(info.clone()), None);
        self.pending_events
            .push_back(ServerEvent::Spawned(info.clone()));
        Ok(info)
    }

    /// Spawns a server-owned object and announces it to every peer.
    pub fn instantiate(
        &mut self,
        prefab_id: u32,
        transform: Transform,
        parent_id: Option<InstanceId>,
    ) -> Result<SpawnInfo, SessionError> {
        self.spawn_for(SERVER_PEER_ID, prefab_id, transform, parent_id)
    }

    /// Destroys an object with its children and announces each removal.
    pub fn destroy(&mut self, instance_id: InstanceId) -> Vec<InstanceId> {
        let removed = self.replication.destroy(instance_id);
        for &id in &removed {
            self.broadcast(Self::reliable(), Payload::Destroy { instance_id: id }, None);
            self.pending_events
                .push_back(ServerEvent::Destroyed { instance_id: id });
        }
        removed
    }

    pub fn start_match(&mut self) {
        if self.state != MatchState::Lobby {
            return;
        }
        self.state = MatchState::InProgress;
        log::info!("match started with {} peers", self.peers.len());
        self.broadcast(Self::reliable(), Payload::StartMatch, None);
        self.pending_events.push_back(ServerEvent::MatchStarted);
    }

    pub fn end_match(&mut self, winner: PeerId) {
        if self.state == MatchState::Finished {
            return;
        }
        self.state = MatchState::Finished;
        log::info!("match ended, winner {}", winner);
        self.broadcast(Self::reliable(), Payload::MatchResult { winner }, None);
        self.pending_events
            .push_back(ServerEvent::MatchEnded { winner });
    }

    pub fn send_chat(&mut self, text: &str) {
        self.broadcast(
            Self::reliable(),
            Payload::Chat {
                from: SERVER_PEER_ID,
                text: text.to_string(),
            },
            None,
        );
    }

    pub fn kick(&mut self, peer_id: PeerId) {
        if let Some(addr) = self.peers.get(peer_id).map(|p| p.addr) {
            let payload = Payload::Disconnect {
                peer_id: SERVER_PEER_ID,
            };
            self.send_to_peer(Priority::empty(), payload, addr);
            self.remove_peer(peer_id, DisconnectReason::Kicked);
        }
    }

    pub fn send_reliable(&mut self, payload: Payload, target: Option<PeerId>) {
        self.send_to(Self::reliable(), payload, target);
    }

    pub fn send_ordered(&mut self, payload: Payload, target: Option<PeerId>) {
        self.send_to(Priority::ORDERED, payload, target);
    }

    pub fn send_unordered(&mut self, payload: Payload, target: Option<PeerId>) {
        self.send_to(Priority::empty(), payload, target);
    }

    fn send_to(&mut self, priority: Priority, payload: Payload, target: Option<PeerId>) {
        match target {
            Some(peer_id) => match self.peers.get(peer_id).map(|p| p.addr) {
                Some(addr) => self.send_to_peer(priority, payload, addr),
                None => log::debug!("no peer {} to send to", peer_id),
            },
            None => self.broadcast(priority, payload, None),
        }
    }

    /// Tells every peer the server is going away and closes the socket.
    /// Later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.running.store(false, Ordering::SeqCst);

        self.broadcast(
            Priority::empty(),
            Payload::Disconnect {
                peer_id: SERVER_PEER_ID,
            },
            None,
        );
        self.endpoint.close();
        log::info!("server on port {} shut down", self.local_addr().port());
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
