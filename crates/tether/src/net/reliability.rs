use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use super::codec::digest;
use super::protocol::MessageType;

#[derive(Debug, Clone)]
pub struct PendingEnvelope {
    pub message_type: MessageType,
    pub bytes: Vec<u8>,
    pub digest: u64,
}

#[derive(Debug, Default)]
struct PendingQueue {
    entries: VecDeque<PendingEnvelope>,
    since_send: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The head was retired. `next` is the envelope that just became head and
    /// must be transmitted now.
    Retired { next: Option<Vec<u8>> },
    /// The digest was already acknowledged recently.
    Duplicate,
    /// Nothing pending matches.
    Unknown,
}

/// Retransmission queues for reliable envelopes, one FIFO per
/// `(remote, message type)`. Only the head of a queue is in flight; later
/// envelopes of the same type wait until the head is acknowledged.
#[derive(Debug)]
pub struct ReliabilityLayer {
    queues: HashMap<(SocketAddr, MessageType), PendingQueue>,
    spent: HashMap<(SocketAddr, u64), f32>,
    history_secs: f32,
}

impl ReliabilityLayer {
    pub fn new(history_secs: f32) -> Self {
        Self {
            queues: HashMap::new(),
            spent: HashMap::new(),
            history_secs,
        }
    }

    /// Queues an encoded reliable envelope. Returns true when it went straight
    /// to the head of its queue and should be transmitted immediately.
    pub fn enqueue(&mut self, addr: SocketAddr, message_type: MessageType, bytes: Vec<u8>) -> bool {
        let queue = self.queues.entry((addr, message_type)).or_default();
        let is_head = queue.entries.is_empty();
        if is_head {
            queue.since_send = 0.0;
        }
        queue.entries.push_back(PendingEnvelope {
            message_type,
            digest: digest(&bytes),
            bytes,
        });
        is_head
    }

    pub fn on_ack(&mut self, addr: SocketAddr, message_type: MessageType, acked: u64) -> AckOutcome {
        if let Some(queue) = self.queues.get_mut(&(addr, message_type)) {
            if queue.entries.front().is_some_and(|head| head.digest == acked) {
                queue.entries.pop_front();
                queue.since_send = 0.0;
                self.spent.insert((addr, acked), self.history_secs);

                let next = queue.entries.front().map(|head| head.bytes.clone());
                if queue.entries.is_empty() {
                    self.queues.remove(&(addr, message_type));
                }
                return AckOutcome::Retired { next };
            }
        }

        if self.spent.contains_key(&(addr, acked)) {
            AckOutcome::Duplicate
        } else {
            AckOutcome::Unknown
        }
    }

    /// Advances resend timers. Heads that waited longer than
    /// `resend_interval(remote)` are returned for retransmission.
    pub fn update<F>(&mut self, dt: f32, resend_interval: F) -> Vec<(SocketAddr, Vec<u8>)>
    where
        F: Fn(&SocketAddr) -> f32,
    {
        self.spent.retain(|_, remaining| {
            *remaining -= dt;
            *remaining > 0.0
        });

        let mut resends = Vec::new();
        for ((addr, _), queue) in self.queues.iter_mut() {
            let Some(head) = queue.entries.front() else {
                continue;
            };
            queue.since_send += dt;
            if queue.since_send >= resend_interval(addr) {
                queue.since_send = 0.0;
                resends.push((*addr, head.bytes.clone()));
            }
        }
        resends
    }

    /// Drops every pending envelope and ack record for the remote.
    pub fn purge(&mut self, addr: &SocketAddr) -> usize {
        let mut dropped = 0;
        self.queues.retain(|(a, _), queue| {
            if a == addr {
                dropped += queue.entries.len();
                false
            } else {
                true
            }
        });
        self.spent.retain(|(a, _), _| a != addr);
        dropped
    }

    pub fn pending_for(&self, addr: &SocketAddr, message_type: MessageType) -> usize {
        self.queues
            .get(&(*addr, message_type))
            .map_or(0, |q| q.entries.len())
    }

    pub fn pending_count(&self, addr: &SocketAddr) -> usize {
        self.queues
            .iter()
            .filter(|((a, _), _)| a == addr)
            .map(|(_, q)| q.entries.len())
            .sum()
    }

    pub fn has_state_for(&self, addr: &SocketAddr) -> bool {
        self.queues.keys().any(|(a, _)| a == addr) || self.spent.keys().any(|(a, _)| a == addr)
    }

    pub fn total_pending(&self) -> usize {
        self.queues.values().map(|q| q.entries.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_resends_once_per_interval_until_acked() {
        let mut layer = ReliabilityLayer::new(15.0);
        let bytes = b"chat-1".to_vec();
        assert!(layer.enqueue(addr(1), MessageType::Chat, bytes.clone()));

        // Every ack lost for two seconds: one resend per 0.5s.
        let mut resends = 0;
        for _ in 0..16 {
            let out = layer.update(0.125, |_| 0.5);
            for (to, data) in &out {
                assert_eq!(*to, addr(1));
                assert_eq!(*data, bytes);
            }
            resends += out.len();
        }
        assert_eq!(resends, 4);

        let outcome = layer.on_ack(addr(1), MessageType::Chat, digest(&bytes));
        assert_eq!(outcome, AckOutcome::Retired { next: None });

        for _ in 0..16 {
            assert!(layer.update(0.125, |_| 0.5).is_empty());
        }
        assert_eq!(layer.total_pending(), 0);
    }

    #[test]
    fn test_same_type_is_serialized() {
        let mut layer = ReliabilityLayer::new(15.0);
        let first = b"first".to_vec();
        let second = b"second".to_vec();

        assert!(layer.enqueue(addr(1), MessageType::Chat, first.clone()));
        assert!(!layer.enqueue(addr(1), MessageType::Chat, second.clone()));
        // A different type has its own queue.
        assert!(layer.enqueue(addr(1), MessageType::Spawn, b"spawn".to_vec()));
        assert_eq!(layer.pending_for(&addr(1), MessageType::Chat), 2);

        // Only the head is retransmitted.
        let out = layer.update(1.0, |_| 0.5);
        assert!(out.iter().any(|(_, b)| *b == first));
        assert!(!out.iter().any(|(_, b)| *b == second));

        let outcome = layer.on_ack(addr(1), MessageType::Chat, digest(&first));
        assert_eq!(
            outcome,
            AckOutcome::Retired {
                next: Some(second.clone())
            }
        );
        assert_eq!(layer.pending_for(&addr(1), MessageType::Chat), 1);
    }

    #[test]
    fn test_late_duplicate_ack_is_idempotent() {
        let mut layer = ReliabilityLayer::new(15.0);
        let first = b"first".to_vec();
        let second = b"second".to_vec();
        layer.enqueue(addr(1), MessageType::Chat, first.clone());
        layer.enqueue(addr(1), MessageType::Chat, second);

        layer.on_ack(addr(1), MessageType::Chat, digest(&first));
        assert_eq!(
            layer.on_ack(addr(1), MessageType::Chat, digest(&first)),
            AckOutcome::Duplicate
        );
        assert_eq!(layer.pending_for(&addr(1), MessageType::Chat), 1);

        // History expires.
        layer.update(16.0, |_| 100.0);
        assert_eq!(
            layer.on_ack(addr(1), MessageType::Chat, digest(&first)),
            AckOutcome::Unknown
        );
    }

    #[test]
    fn test_purge_drops_everything_for_remote() {
        let mut layer = ReliabilityLayer::new(15.0);
        layer.enqueue(addr(1), MessageType::Chat, b"a".to_vec());
        layer.enqueue(addr(1), MessageType::Chat, b"b".to_vec());
        layer.enqueue(addr(1), MessageType::Spawn, b"c".to_vec());
        layer.enqueue(addr(2), MessageType::Chat, b"d".to_vec());

        assert_eq!(layer.purge(&addr(1)), 3);
        assert!(!layer.has_state_for(&addr(1)));
        assert_eq!(layer.pending_count(&addr(2)), 1);
        assert!(layer.update(10.0, |_| 0.5).iter().all(|(a, _)| *a == addr(2)));
    }
}
