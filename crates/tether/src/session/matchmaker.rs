use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::error::SessionError;
use super::events::{DisconnectReason, MatchmakerEvent};
use super::launcher::{LaunchRequest, ServerLauncher};
use super::peer::{PeerTable, Rejection, is_valid_name, names_collide};
use super::queue::WaitingQueue;
use crate::net::{
    DEFAULT_TICK_RATE, Endpoint, EndpointEvent, Envelope, MessageType, NetConfig, Payload, PeerId,
    Priority, SERVER_PEER_ID,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakerConfig {
    pub tick_rate: u32,
    /// Waiting peers needed before a server is provisioned.
    pub min_players: usize,
    pub max_waiting: usize,
    /// Inclusive range of ports handed to provisioned servers.
    pub server_port_start: u16,
    pub server_port_end: u16,
    /// A launched server that has not reported ready by then is abandoned.
    pub launch_timeout_secs: f32,
    /// Pause before retrying after a failed launch.
    pub launch_retry_secs: f32,
    pub net: NetConfig,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            min_players: 2,
            max_waiting: 64,
            server_port_start: 27100,
            server_port_end: 27199,
            launch_timeout_secs: 10.0,
            launch_retry_secs: 1.0,
            net: NetConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct SubSession {
    addr: Option<SocketAddr>,
    /// Selected peers that have not been redirected yet.
    selected: Vec<PeerId>,
    names: Vec<String>,
    waited: f32,
}

impl SubSession {
    fn is_ready(&self) -> bool {
        self.addr.is_some()
    }
}

/// Snapshot of one provisioned server.
#[derive(Debug, Clone, PartialEq)]
pub struct SubSessionInfo {
    pub port: u16,
    pub ready: bool,
    pub names: Vec<String>,
}

/// Admits peers, groups them and hands each group a freshly launched server.
pub struct Matchmaker {
    endpoint: Endpoint,
    peers: PeerTable,
    queue: WaitingQueue,
    launcher: Box<dyn ServerLauncher>,
    sessions: BTreeMap<u16, SubSession>,
    redirecting: HashMap<PeerId, u16>,
    config: MatchmakerConfig,
    retry_timer: f32,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    shut_down: bool,
    pending_events: VecDeque<MatchmakerEvent>,
}

impl Matchmaker {
    pub fn new<L: ServerLauncher + 'static>(
        bind_addr: &str,
        config: MatchmakerConfig,
        launcher: L,
    ) -> Result<Self, SessionError> {
        let endpoint = Endpoint::bind(bind_addr, config.net.clone())?;
        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64);

        Ok(Self {
            endpoint,
            peers: PeerTable::new(config.max_waiting),
            queue: WaitingQueue::new(config.min_players),
            launcher: Box::new(launcher),
            sessions: BTreeMap::new(),
            redirecting: HashMap::new(),
            retry_timer: 0.0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            shut_down: false,
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Address provisioned servers report to. An unspecified bind address is
    /// advertised as loopback.
    pub fn advertised_addr(&self) -> SocketAddr {
        let local = self.local_addr();
        if local.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        } else {
            local
        }
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = MatchmakerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn waiting_count(&self) -> usize {
        self.queue.len()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn sessions(&self) -> Vec<SubSessionInfo> {
        self.sessions
            .iter()
            .map(|(&port, s)| SubSessionInfo {
                port,
                ready: s.is_ready(),
                names: s.names.clone(),
            })
            .collect()
    }

    pub fn run(&mut self) {
        while self.is_running() {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.update(self.tick_duration.as_secs_f32());
        }
    }

    pub fn update(&mut self, dt: f32) {
        if self.shut_down {
            return;
        }

        for event in self.endpoint.poll(dt) {
            match event {
                EndpointEvent::Message { from, envelope } => self.handle_message(from, envelope),
                EndpointEvent::Acknowledged {
                    from,
                    message_type: MessageType::Redirect,
                } => self.finish_redirect(from),
                EndpointEvent::Acknowledged { .. } => {}
                EndpointEvent::TimedOut(addr) => self.handle_timeout(addr),
            }
        }

        self.expire_launches(dt);
        self.retry_timer = (self.retry_timer - dt).max(0.0);
        self.try_match();
    }

    fn send(&mut self, payload: Payload, addr: SocketAddr) {
        if let Err(e) = self
            .endpoint
            .send(Priority::RELIABLE | Priority::ORDERED, payload, Some(addr))
        {
            log::warn!("send to {} failed: {}", addr, e);
        }
    }

    fn handle_message(&mut self, from: SocketAddr, envelope: Envelope) {
        match envelope.payload {
            Payload::Handshake { name } => self.handle_handshake(from, &name),
            Payload::ServerReady { port } => self.handle_server_ready(from, port),
            Payload::NameList { port, names } => match self.sessions.get_mut(&port) {
                Some(session) => session.names = names,
                None => log::debug!("name report for unknown port {}", port),
            },
            Payload::Disconnect { .. } => {
                if let Some(id) = self.peers.id_of(&from) {
                    self.remove_peer(id, DisconnectReason::Graceful);
                }
            }
            other => log::debug!("ignoring {:?} from {}", other.message_type(), from),
        }
    }

    fn name_in_use(&self, name: &str) -> bool {
        self.peers.has_name(name)
            || self
                .sessions
                .values()
                .flat_map(|s| s.names.iter())
                .any(|n| names_collide(n, name))
    }

    fn handle_handshake(&mut self, from: SocketAddr, name: &str) {
        if self.peers.id_of(&from).is_some() {
            log::debug!("repeated handshake from {}", from);
            return;
        }

        let admitted = if !is_valid_name(name) || self.name_in_use(name) {
            Err(Rejection::InvalidName)
        } else {
            self.peers.admit(from, name).map(|p| p.info())
        };

        let info = match admitted {
            Ok(info) => info,
            Err(rejection) => return self.reject(from, name, rejection),
        };

        self.endpoint.forget(&from);
        self.endpoint.track(from);

        // Queued peers learn who they play with from the server.
        let welcome = Payload::Welcome {
            peer_id: info.id,
            peers: Vec::new(),
        };
        if let Err(e) = self.endpoint.send_reliable(welcome, Some(from)) {
            log::warn!("welcome to {} failed: {}", from, e);
            self.peers.remove(info.id);
            self.endpoint.forget(&from);
            return self.reject(from, name, Rejection::ServerFull);
        }

        self.queue.enqueue(info.id);
        log::info!("peer {} ({}) waiting, {} in queue", info.id, info.name, self.queue.len());
        self.pending_events.push_back(MatchmakerEvent::PeerAdmitted {
            peer_id: info.id,
            name: info.name,
        });
    }

    fn reject(&mut self, from: SocketAddr, name: &str, rejection: Rejection) {
        log::info!("rejected {} ({}): {}", from, name, rejection);
        self.send(
            Payload::Error {
                reason: rejection.as_str().to_string(),
            },
            from,
        );
        self.endpoint
            .linger(from, self.config.net.disconnect_threshold_secs);
        self.pending_events.push_back(MatchmakerEvent::PeerRejected {
            addr: from,
            reason: rejection.as_str().to_string(),
        });
    }

    fn free_port(&self) -> Result<u16, SessionError> {
        let own = self.local_addr().port();
        let (start, end) = (self.config.server_port_start, self.config.server_port_end);
        (start..=end)
            .find(|port| *port != own && !self.sessions.contains_key(port))
            .ok_or(SessionError::NoFreePort { start, end })
    }

    fn try_match(&mut self) {
        if self.retry_timer > 0.0 {
            return;
        }

        while let Some(selected) = self.queue.pop_match() {
            let port = match self.free_port() {
                Ok(port) => port,
                Err(e) => {
                    log::warn!("{}", e);
                    self.queue.requeue_front(&selected);
                    self.retry_timer = self.config.launch_retry_secs;
                    return;
                }
            };

            let request = LaunchRequest {
                port,
                matchmaker: self.advertised_addr(),
                expected_players: selected.len(),
            };
            if let Err(e) = self.launcher.launch(&request) {
                log::warn!("{}", e);
                self.queue.requeue_front(&selected);
                self.retry_timer = self.config.launch_retry_secs;
                self.pending_events.push_back(MatchmakerEvent::LaunchFailed {
                    port,
                    message: e.to_string(),
                });
                return;
            }

            log::info!("provisioning server on port {} for {:?}", port, selected);
            let names = selected
                .iter()
                .filter_map(|id| self.peers.get(*id).map(|p| p.name.clone()))
                .collect();
            self.sessions.insert(
                port,
                SubSession {
                    addr: None,
                    selected: selected.clone(),
                    names,
                    waited: 0.0,
                },
            );
            self.pending_events.push_back(MatchmakerEvent::ServerLaunched {
                port,
                peers: selected,
            });
        }
    }

    fn handle_server_ready(&mut self, from: SocketAddr, port: u16) {
        let Some(session) = self.sessions.get_mut(&port) else {
            log::debug!("ready report from unknown server on port {}", port);
            return;
        };
        if session.is_ready() {
            return;
        }
        session.addr = Some(from);
        let selected = std::mem::take(&mut session.selected);

        self.endpoint.track(from);
        log::info!("server on port {} ready, redirecting {} peers", port, selected.len());
        self.pending_events
            .push_back(MatchmakerEvent::ServerReady { port });

        for peer_id in selected {
            let Some(addr) = self.peers.get(peer_id).map(|p| p.addr) else {
                continue;
            };
            self.send(Payload::Redirect { port }, addr);
            self.redirecting.insert(peer_id, port);
            self.pending_events
                .push_back(MatchmakerEvent::PeerRedirected { peer_id, port });
        }
    }

    /// A redirected peer acknowledged; the server owns it from now on.
    fn finish_redirect(&mut self, from: SocketAddr) {
        let Some(peer_id) = self.peers.id_of(&from) else {
            return;
        };
        if self.redirecting.remove(&peer_id).is_none() {
            return;
        }
        if let Some(peer) = self.peers.remove(peer_id) {
            self.endpoint.forget(&peer.addr);
            log::debug!("peer {} ({}) handed over", peer.id, peer.name);
        }
    }

    fn handle_timeout(&mut self, addr: SocketAddr) {
        if let Some(id) = self.peers.id_of(&addr) {
            self.remove_peer(id, DisconnectReason::Timeout);
            return;
        }

        let port = self
            .sessions
            .iter()
            .find(|(_, s)| s.addr == Some(addr))
            .map(|(&port, _)| port);
        if let Some(port) = port {
            log::info!("server on port {} went silent", port);
            self.close_session(port);
        }
    }

    fn close_session(&mut self, port: u16) {
        if let Some(session) = self.sessions.remove(&port) {
            if let Some(addr) = session.addr {
                self.endpoint.forget(&addr);
            }
            self.launcher.terminate(port);
            self.pending_events
                .push_back(MatchmakerEvent::SessionClosed { port });
        }
    }

    fn expire_launches(&mut self, dt: f32) {
        let timeout = self.config.launch_timeout_secs;
        let mut expired = Vec::new();
        for (&port, session) in self.sessions.iter_mut() {
            if session.is_ready() {
                continue;
            }
            session.waited += dt;
            if session.waited > timeout {
                expired.push(port);
            }
        }

        for port in expired {
            let Some(session) = self.sessions.remove(&port) else {
                continue;
            };
            log::warn!("server on port {} never reported ready", port);
            self.launcher.terminate(port);

            let still_here: Vec<PeerId> = session
                .selected
                .into_iter()
                .filter(|id| self.peers.get(*id).is_some())
                .collect();
            self.queue.requeue_front(&still_here);
            self.pending_events.push_back(MatchmakerEvent::LaunchFailed {
                port,
                message: "server did not report ready".to_string(),
            });
        }
    }

    fn remove_peer(&mut self, peer_id: PeerId, reason: DisconnectReason) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };
        self.endpoint.forget(&peer.addr);
        self.queue.dequeue(peer_id);
        self.redirecting.remove(&peer_id);
        for session in self.sessions.values_mut() {
            session.selected.retain(|id| *id != peer_id);
            if !session.is_ready() {
                session.names.retain(|n| !names_collide(n, &peer.name));
            }
        }

        log::info!("peer {} ({}) {}", peer.id, peer.name, reason.as_str());
        self.pending_events
            .push_back(MatchmakerEvent::PeerLeft { peer_id, reason });
    }

    /// Disconnects every waiting peer and closes the socket. Later calls do
    /// nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.running.store(false, Ordering::SeqCst);

        for addr in self.peers.addrs() {
            let payload = Payload::Disconnect {
                peer_id: SERVER_PEER_ID,
            };
            if let Err(e) = self.endpoint.send_unordered(payload, Some(addr)) {
                log::warn!("send to {} failed: {}", addr, e);
            }
        }
        self.endpoint.close();
        log::info!("matchmaker shut down");
    }
}

impl Drop for Matchmaker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
