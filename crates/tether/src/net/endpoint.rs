use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use super::codec::{self, CodecError, digest};
use super::config::NetConfig;
use super::liveness::LivenessMonitor;
use super::ordering::{FIRST_ORDER, OrderingFilter, Verdict};
use super::protocol::{Envelope, MessageType, Payload, Priority};
use super::reliability::{AckOutcome, ReliabilityLayer};
use super::stats::{NetworkStats, PacketLossSimulation};
use super::transport::{Datagram, Transport};

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// An application envelope that passed decoding and ordering.
    Message { from: SocketAddr, envelope: Envelope },
    /// A reliable envelope previously sent to `from` was acknowledged.
    Acknowledged {
        from: SocketAddr,
        message_type: MessageType,
    },
    /// The remote was silent past the disconnect threshold. All of its
    /// protocol state has already been dropped.
    TimedOut(SocketAddr),
}

/// One socket with its liveness, ordering and reliability state. Acks and
/// pings are answered inside [`Endpoint::poll`] and never surface as events.
pub struct Endpoint {
    transport: Transport,
    liveness: LivenessMonitor,
    ordering: OrderingFilter,
    reliability: ReliabilityLayer,
    lingering: HashMap<SocketAddr, f32>,
    config: NetConfig,
}

impl Endpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: NetConfig) -> io::Result<Self> {
        let transport = Transport::bind(addr)?;
        Ok(Self {
            transport,
            liveness: LivenessMonitor::new(&config),
            ordering: OrderingFilter::new(),
            reliability: ReliabilityLayer::new(config.ack_history_secs),
            lingering: HashMap::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn stats(&self) -> &NetworkStats {
        self.transport.stats()
    }

    pub fn set_packet_loss_sim(&mut self, sim: PacketLossSimulation) {
        self.transport.set_packet_loss_sim(sim);
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Starts heartbeats and ordering for a remote. Broadcasts go to every
    /// tracked remote.
    pub fn track(&mut self, addr: SocketAddr) {
        self.lingering.remove(&addr);
        self.liveness.track(addr);
        self.ordering.join(addr);
    }

    /// Keeps an untracked remote's pending reliable sends, e.g. a rejection,
    /// for `secs` before forgetting it. Outbound order numbers restart, so an
    /// answer to a retry from the same address is numbered from the start.
    pub fn linger(&mut self, addr: SocketAddr, secs: f32) {
        if !self.liveness.is_tracked(&addr) {
            self.ordering.leave(&addr);
            self.lingering.insert(addr, secs);
        }
    }

    /// Drops every piece of state held for the remote.
    pub fn forget(&mut self, addr: &SocketAddr) {
        self.lingering.remove(addr);
        self.liveness.untrack(addr);
        self.ordering.leave(addr);
        let dropped = self.reliability.purge(addr);
        if dropped > 0 {
            log::debug!("dropped {} unacknowledged envelopes for {}", dropped, addr);
        }
    }

    pub fn is_tracked(&self, addr: &SocketAddr) -> bool {
        self.liveness.is_tracked(addr)
    }

    pub fn tracked(&self) -> Vec<SocketAddr> {
        self.liveness.tracked().copied().collect()
    }

    pub fn latency(&self, addr: &SocketAddr) -> f32 {
        self.liveness.latency(addr)
    }

    pub fn pending_reliable(&self, addr: &SocketAddr) -> usize {
        self.reliability.pending_count(addr)
    }

    /// True while any ordering, reliability or liveness state exists for `addr`.
    pub fn has_state_for(&self, addr: &SocketAddr) -> bool {
        self.liveness.is_tracked(addr)
            || self.ordering.has_state_for(addr)
            || self.reliability.has_state_for(addr)
    }

    pub fn send_reliable(
        &mut self,
        payload: Payload,
        target: Option<SocketAddr>,
    ) -> Result<(), CodecError> {
        self.send(Priority::RELIABLE | Priority::ORDERED, payload, target)
    }

    pub fn send_ordered(
        &mut self,
        payload: Payload,
        target: Option<SocketAddr>,
    ) -> Result<(), CodecError> {
        self.send(Priority::ORDERED, payload, target)
    }

    pub fn send_unordered(
        &mut self,
        payload: Payload,
        target: Option<SocketAddr>,
    ) -> Result<(), CodecError> {
        self.send(Priority::empty(), payload, target)
    }

    /// Sends to `target`, or to every tracked remote when `target` is `None`.
    /// A broadcast that cannot be encoded reaches nobody.
    pub fn send(
        &mut self,
        priority: Priority,
        payload: Payload,
        target: Option<SocketAddr>,
    ) -> Result<(), CodecError> {
        match target {
            Some(addr) => self.send_one(priority, payload, addr),
            None => {
                // Order numbers differ per remote, the encoded size does not.
                let mut envelope = Envelope::new(priority, payload);
                if envelope.is_ordered() {
                    envelope.order = Some(FIRST_ORDER);
                }
                codec::encode(&envelope)?;

                for addr in self.tracked() {
                    if let Err(e) = self.send_one(priority, envelope.payload.clone(), addr) {
                        log::warn!("broadcast to {} failed: {}", addr, e);
                    }
                }
                Ok(())
            }
        }
    }

    fn send_one(
        &mut self,
        priority: Priority,
        payload: Payload,
        addr: SocketAddr,
    ) -> Result<(), CodecError> {
        let mut envelope = Envelope::new(priority, payload);
        let message_type = envelope.message_type();
        if envelope.is_ordered() {
            envelope.order = Some(self.ordering.peek_order(addr, message_type));
        }
        let bytes = codec::encode(&envelope)?;
        if envelope.is_ordered() {
            self.ordering.next_order(addr, message_type);
        }

        if envelope.is_reliable() {
            if self.reliability.enqueue(addr, message_type, bytes.clone()) {
                self.transport.send_to(&bytes, addr);
            }
        } else {
            self.transport.send_to(&bytes, addr);
        }
        Ok(())
    }

    fn send_control(&mut self, payload: Payload, addr: SocketAddr) {
        let envelope = Envelope::unordered(payload);
        match codec::encode(&envelope) {
            Ok(bytes) => self.transport.send_to(&bytes, addr),
            Err(e) => log::warn!(
                "failed to encode {:?} for {}: {}",
                envelope.message_type(),
                addr,
                e
            ),
        }
    }

    /// Processes received datagrams, answers acks and pings, and advances
    /// heartbeats and retransmissions by `dt` seconds.
    pub fn poll(&mut self, dt: f32) -> Vec<EndpointEvent> {
        let mut events = Vec::new();

        for datagram in self.transport.flush() {
            self.handle_datagram(datagram, &mut events);
        }

        let tick = self.liveness.update(dt);
        for addr in tick.evicted {
            log::info!("{} timed out", addr);
            self.ordering.leave(&addr);
            self.reliability.purge(&addr);
            events.push(EndpointEvent::TimedOut(addr));
        }
        for (addr, nonce) in tick.pings {
            self.send_control(Payload::Ping { nonce, reply: false }, addr);
        }

        let mut expired = Vec::new();
        self.lingering.retain(|addr, remaining| {
            *remaining -= dt;
            if *remaining > 0.0 {
                return true;
            }
            expired.push(*addr);
            false
        });
        for addr in expired {
            self.forget(&addr);
        }

        let config = &self.config;
        let liveness = &self.liveness;
        let resends = self
            .reliability
            .update(dt, |addr| config.resend_interval(liveness.latency(addr)));
        for (addr, bytes) in resends {
            log::debug!("resending {} bytes to {}", bytes.len(), addr);
            self.transport.stats_mut().retransmissions += 1;
            self.transport.send_to(&bytes, addr);
        }

        events
    }

    fn handle_datagram(&mut self, datagram: Datagram, events: &mut Vec<EndpointEvent>) {
        let Datagram { bytes, from } = datagram;
        let envelope = match codec::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.transport.stats_mut().packets_corrupted += 1;
                log::debug!("discarding datagram from {}: {}", from, e);
                return;
            }
        };
        self.liveness.touch(&from);

        match envelope.payload {
            Payload::Ack { acked, digest } => match self.reliability.on_ack(from, acked, digest) {
                AckOutcome::Retired { next } => {
                    if let Some(next) = next {
                        self.transport.send_to(&next, from);
                    }
                    events.push(EndpointEvent::Acknowledged {
                        from,
                        message_type: acked,
                    });
                }
                AckOutcome::Duplicate => {}
                AckOutcome::Unknown => {
                    log::debug!("ignoring unmatched {:?} ack from {}", acked, from)
                }
            },
            Payload::Ping { nonce, reply: false } => {
                if self.liveness.is_tracked(&from) {
                    self.send_control(Payload::Ping { nonce, reply: true }, from);
                }
            }
            Payload::Ping { nonce, reply: true } => {
                self.liveness.on_ping_reply(&from, nonce);
            }
            _ => {
                let message_type = envelope.message_type();
                let reliable = envelope.is_reliable();
                let deliver = match envelope.order {
                    None => true,
                    Some(order) => match self.ordering.check(&from, message_type, order) {
                        Verdict::Accepted => true,
                        Verdict::OutOfPhase if reliable => {
                            // Reliable envelopes are resent until acked; follow them.
                            self.ordering.resync(&from, message_type, order);
                            true
                        }
                        verdict => {
                            log::debug!(
                                "dropping {:?} #{} from {}: {:?}",
                                message_type,
                                order,
                                from,
                                verdict
                            );
                            false
                        }
                    },
                };

                // Stale reliable copies are acked again so the sender can retire them.
                if reliable {
                    self.send_control(
                        Payload::Ack {
                            acked: message_type,
                            digest: digest(&bytes),
                        },
                        from,
                    );
                }
                if deliver {
                    events.push(EndpointEvent::Message { from, envelope });
                }
            }
        }
    }

    /// Closes the socket. Pending state is discarded; safe to call twice.
    pub fn close(&mut self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn bind() -> Endpoint {
        Endpoint::bind("127.0.0.1:0", NetConfig::default()).unwrap()
    }

    fn poll_until<F>(
        endpoints: &mut [&mut Endpoint],
        timeout_ms: u64,
        mut done: F,
    ) -> Vec<Vec<EndpointEvent>>
    where
        F: FnMut(&[Vec<EndpointEvent>]) -> bool,
    {
        let mut seen: Vec<Vec<EndpointEvent>> = vec![Vec::new(); endpoints.len()];
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            for (i, endpoint) in endpoints.iter_mut().enumerate() {
                seen[i].extend(endpoint.poll(0.001));
            }
            if done(&seen) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        seen
    }

    fn messages(events: &[EndpointEvent]) -> Vec<&Payload> {
        events
            .iter()
            .filter_map(|e| match e {
                EndpointEvent::Message { envelope, .. } => Some(&envelope.payload),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_reliable_send_is_acknowledged() {
        let mut a = bind();
        let mut b = bind();
        a.track(b.local_addr());

        let chat = Payload::Chat {
            from: 1,
            text: "hello".into(),
        };
        a.send_reliable(chat.clone(), Some(b.local_addr())).unwrap();
        assert_eq!(a.pending_reliable(&b.local_addr()), 1);

        let seen = poll_until(&mut [&mut a, &mut b], 1000, |seen| {
            seen[0]
                .iter()
                .any(|e| matches!(e, EndpointEvent::Acknowledged { .. }))
        });

        assert_eq!(messages(&seen[1]), vec![&chat]);
        assert!(seen[0].contains(&EndpointEvent::Acknowledged {
            from: b.local_addr(),
            message_type: MessageType::Chat,
        }));
        assert_eq!(a.pending_reliable(&b.local_addr()), 0);
    }

    #[test]
    fn test_queued_reliable_follows_ack() {
        let mut a = bind();
        let mut b = bind();
        let target = Some(b.local_addr());

        for text in ["one", "two", "three"] {
            a.send_reliable(
                Payload::Chat {
                    from: 1,
                    text: text.into(),
                },
                target,
            )
            .unwrap();
        }

        let seen = poll_until(&mut [&mut a, &mut b], 2000, |seen| messages(&seen[1]).len() == 3);
        let texts: Vec<_> = messages(&seen[1])
            .into_iter()
            .filter_map(|p| match p {
                Payload::Chat { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_duplicate_ordered_datagram_is_filtered() {
        let mut a = bind();
        let mut b = bind();
        b.track(a.local_addr());

        let mut envelope = Envelope::new(Priority::ORDERED, Payload::StartMatch);
        envelope.order = Some(1);
        let bytes = codec::encode(&envelope).unwrap();

        a.transport.send_to(&bytes, b.local_addr());
        a.transport.send_to(&bytes, b.local_addr());

        std::thread::sleep(Duration::from_millis(50));
        let events = b.poll(0.0);
        assert_eq!(messages(&events).len(), 1);
    }

    #[test]
    fn test_corrupted_datagram_is_counted() {
        let mut a = bind();
        let mut b = bind();

        let mut bytes = codec::encode(&Envelope::unordered(Payload::StartMatch)).unwrap();
        bytes.truncate(bytes.len() - 1);
        a.transport.send_to(&bytes, b.local_addr());

        let start = Instant::now();
        while b.stats().packets_corrupted == 0 && start.elapsed() < Duration::from_millis(500) {
            assert!(b.poll(0.0).is_empty());
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(b.stats().packets_corrupted, 1);
    }

    #[test]
    fn test_silent_remote_is_evicted_with_its_state() {
        let mut a = bind();
        let dead = {
            let b = bind();
            b.local_addr()
        };

        a.track(dead);
        a.send_reliable(Payload::StartMatch, Some(dead)).unwrap();
        assert!(a.has_state_for(&dead));

        let mut timed_out = false;
        for _ in 0..12 {
            timed_out |= a.poll(0.5).contains(&EndpointEvent::TimedOut(dead));
        }
        assert!(timed_out);
        assert!(!a.has_state_for(&dead));
        assert!(a.tracked().is_empty());
    }

    #[test]
    fn test_ping_round_trip_updates_latency() {
        let mut a = bind();
        let mut b = bind();
        a.track(b.local_addr());
        b.track(a.local_addr());

        // The first poll crosses the ping interval.
        a.poll(1.0);
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            b.poll(0.0);
            a.poll(0.0);
            if (a.latency(&b.local_addr()) - 0.1).abs() > 1e-6 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        // Time only moves through poll deltas, all zero after the ping.
        assert!(a.latency(&b.local_addr()).abs() < 1e-6);
    }

    fn chat(text: &str) -> Payload {
        Payload::Chat {
            from: 1,
            text: text.into(),
        }
    }

    #[test]
    fn test_failed_encode_does_not_spend_order_number() {
        let mut a = bind();
        let mut b = bind();
        a.track(b.local_addr());
        b.track(a.local_addr());
        let target = Some(b.local_addr());

        assert!(matches!(
            a.send_reliable(chat(&"x".repeat(700)), target),
            Err(CodecError::TooLarge(_))
        ));
        assert_eq!(a.pending_reliable(&b.local_addr()), 0);
        a.send_reliable(chat("hello"), target).unwrap();

        let seen = poll_until(&mut [&mut a, &mut b], 1000, |seen| {
            seen[0]
                .iter()
                .any(|e| matches!(e, EndpointEvent::Acknowledged { .. }))
        });
        assert_eq!(messages(&seen[1]), vec![&chat("hello")]);
        assert_eq!(a.pending_reliable(&b.local_addr()), 0);
    }

    #[test]
    fn test_out_of_phase_reliable_is_delivered_once() {
        let mut a = bind();
        let mut b = bind();
        b.track(a.local_addr());

        // Order 2 arrives first, as if order 1 had been an ordered send that was lost.
        let mut envelope = Envelope::new(Priority::RELIABLE | Priority::ORDERED, chat("late"));
        envelope.order = Some(2);
        let bytes = codec::encode(&envelope).unwrap();
        a.transport.send_to(&bytes, b.local_addr());
        a.transport.send_to(&bytes, b.local_addr());

        let seen = poll_until(&mut [&mut b], 500, |seen| !seen[0].is_empty());
        std::thread::sleep(Duration::from_millis(50));
        let mut events = seen.into_iter().flatten().collect::<Vec<_>>();
        events.extend(b.poll(0.0));
        assert_eq!(messages(&events), vec![&chat("late")]);

        // An unreliable ordered envelope with the wrong parity is still dropped.
        let mut envelope = Envelope::new(Priority::ORDERED, chat("gap"));
        envelope.order = Some(4);
        a.transport
            .send_to(&codec::encode(&envelope).unwrap(), b.local_addr());
        std::thread::sleep(Duration::from_millis(50));
        assert!(messages(&b.poll(0.0)).is_empty());
    }

    #[test]
    fn test_broadcast_too_large_reaches_nobody() {
        let mut a = bind();
        let b = bind();
        let c = bind();
        a.track(b.local_addr());
        a.track(c.local_addr());

        assert!(a.send_reliable(chat(&"x".repeat(700)), None).is_err());
        assert_eq!(a.pending_reliable(&b.local_addr()), 0);
        assert_eq!(a.pending_reliable(&c.local_addr()), 0);

        a.send_reliable(chat("hi"), None).unwrap();
        assert_eq!(a.pending_reliable(&b.local_addr()), 1);
        assert_eq!(a.pending_reliable(&c.local_addr()), 1);
    }

    #[test]
    fn test_pings_are_answered_only_for_tracked_remotes() {
        let mut b = bind();
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let ping = codec::encode(&Envelope::unordered(Payload::Ping {
            nonce: 7,
            reply: false,
        }))
        .unwrap();

        let reply_seen = |b: &mut Endpoint| {
            socket.send_to(&ping, b.local_addr()).unwrap();
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(300) {
                b.poll(0.0);
                let mut buf = [0u8; 1500];
                if let Ok((n, _)) = socket.recv_from(&mut buf) {
                    if let Ok(Envelope {
                        payload: Payload::Ping { nonce: 7, reply: true },
                        ..
                    }) = codec::decode(&buf[..n])
                    {
                        return true;
                    }
                }
            }
            false
        };

        assert!(!reply_seen(&mut b));
        b.track(socket.local_addr().unwrap());
        assert!(reply_seen(&mut b));
    }

    #[test]
    fn test_lingering_remote_is_forgotten() {
        let mut a = bind();
        let b = bind();

        a.send_reliable(Payload::StartMatch, Some(b.local_addr())).unwrap();
        a.linger(b.local_addr(), 1.0);
        a.poll(0.6);
        assert!(a.has_state_for(&b.local_addr()));
        a.poll(0.6);
        assert!(!a.has_state_for(&b.local_addr()));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut a = bind();
        a.close();
        a.close();
        assert!(!a.is_open());
        assert!(a.send_unordered(Payload::StartMatch, None).is_ok());
    }
}
