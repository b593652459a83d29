use std::collections::HashMap;
use std::net::SocketAddr;

use super::config::NetConfig;

const LATENCY_ALPHA: f32 = 0.125;

#[derive(Debug, Clone)]
struct PeerLiveness {
    last_heard: f64,
    latency: f32,
    samples: u32,
    pending_ping: Option<(u32, f64)>,
}

/// Work produced by one [`LivenessMonitor::update`].
#[derive(Debug, Default, PartialEq)]
pub struct LivenessTick {
    /// `(remote, nonce)` pairs that need a ping sent now.
    pub pings: Vec<(SocketAddr, u32)>,
    /// Remotes silent for longer than the disconnect threshold. They are no
    /// longer tracked.
    pub evicted: Vec<SocketAddr>,
}

/// Heartbeat bookkeeping for every remote an endpoint talks to. Time only
/// advances through `update`, so all expiry happens on the tick thread.
#[derive(Debug)]
pub struct LivenessMonitor {
    clock: f64,
    since_ping: f32,
    next_nonce: u32,
    ping_interval: f32,
    disconnect_threshold: f32,
    initial_latency: f32,
    peers: HashMap<SocketAddr, PeerLiveness>,
}

impl LivenessMonitor {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            clock: 0.0,
            since_ping: 0.0,
            next_nonce: 1,
            ping_interval: config.ping_interval_secs,
            disconnect_threshold: config.disconnect_threshold_secs,
            initial_latency: config.initial_latency_secs,
            peers: HashMap::new(),
        }
    }

    pub fn track(&mut self, addr: SocketAddr) {
        let now = self.clock;
        let initial_latency = self.initial_latency;
        self.peers.entry(addr).or_insert_with(|| PeerLiveness {
            last_heard: now,
            latency: initial_latency,
            samples: 0,
            pending_ping: None,
        });
    }

    pub fn untrack(&mut self, addr: &SocketAddr) -> bool {
        self.peers.remove(addr).is_some()
    }

    pub fn is_tracked(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn tracked(&self) -> impl Iterator<Item = &SocketAddr> {
        self.peers.keys()
    }

    /// Any datagram from a remote proves it alive.
    pub fn touch(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.last_heard = self.clock;
        }
    }

    /// Smoothed round trip in seconds; the initial estimate until sampled.
    pub fn latency(&self, addr: &SocketAddr) -> f32 {
        self.peers
            .get(addr)
            .map_or(self.initial_latency, |p| p.latency)
    }

    /// Records a latency sample when `nonce` answers the outstanding ping.
    pub fn on_ping_reply(&mut self, addr: &SocketAddr, nonce: u32) -> Option<f32> {
        let clock = self.clock;
        let peer = self.peers.get_mut(addr)?;
        let (expected, sent_at) = peer.pending_ping?;
        if expected != nonce {
            return None;
        }
        peer.pending_ping = None;

        let sample = (clock - sent_at) as f32;
        if peer.samples == 0 {
            peer.latency = sample;
        } else {
            peer.latency = (1.0 - LATENCY_ALPHA) * peer.latency + LATENCY_ALPHA * sample;
        }
        peer.samples += 1;
        Some(sample)
    }

    pub fn update(&mut self, dt: f32) -> LivenessTick {
        self.clock += dt as f64;
        self.since_ping += dt;

        let mut tick = LivenessTick::default();

        let threshold = self.disconnect_threshold as f64;
        let clock = self.clock;
        tick.evicted = self
            .peers
            .iter()
            .filter(|(_, p)| clock - p.last_heard > threshold)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &tick.evicted {
            self.peers.remove(addr);
        }

        if self.since_ping >= self.ping_interval {
            self.since_ping = 0.0;
            for (addr, peer) in self.peers.iter_mut() {
                let nonce = self.next_nonce;
                self.next_nonce = self.next_nonce.wrapping_add(1);
                peer.pending_ping = Some((nonce, clock));
                tick.pings.push((*addr, nonce));
            }
        }

        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_pings_every_interval() {
        let mut monitor = LivenessMonitor::new(&NetConfig::default());
        monitor.track(addr(1));
        monitor.track(addr(2));

        assert!(monitor.update(0.5).pings.is_empty());
        let tick = monitor.update(0.5);
        assert_eq!(tick.pings.len(), 2);
        assert!(monitor.update(0.5).pings.is_empty());
    }

    #[test]
    fn test_silent_peer_is_evicted() {
        let mut monitor = LivenessMonitor::new(&NetConfig::default());
        monitor.track(addr(1));
        monitor.track(addr(2));

        for _ in 0..10 {
            monitor.update(0.5);
            monitor.touch(&addr(2));
        }
        let tick = monitor.update(0.5);
        assert_eq!(tick.evicted, vec![addr(1)]);
        assert!(!monitor.is_tracked(&addr(1)));
        assert!(monitor.is_tracked(&addr(2)));
    }

    #[test]
    fn test_ping_reply_samples_latency() {
        let mut monitor = LivenessMonitor::new(&NetConfig::default());
        monitor.track(addr(1));

        let tick = monitor.update(1.0);
        let (_, nonce) = tick.pings[0];
        monitor.update(0.25);

        assert_eq!(monitor.on_ping_reply(&addr(1), nonce.wrapping_add(9)), None);
        let sample = monitor.on_ping_reply(&addr(1), nonce).unwrap();
        assert!((sample - 0.25).abs() < 1e-4);
        assert!((monitor.latency(&addr(1)) - 0.25).abs() < 1e-4);

        // A reply is only counted once.
        assert_eq!(monitor.on_ping_reply(&addr(1), nonce), None);
    }

    #[test]
    fn test_untracked_latency_uses_initial_estimate() {
        let monitor = LivenessMonitor::new(&NetConfig::default());
        assert!((monitor.latency(&addr(9)) - 0.1).abs() < 1e-6);
    }
}
