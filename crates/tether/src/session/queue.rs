use std::collections::VecDeque;
use std::time::Instant;

use crate::net::PeerId;

/// Admitted peers waiting for a server, oldest first.
#[derive(Debug)]
pub struct WaitingQueue {
    peers: VecDeque<(PeerId, Instant)>,
    match_size: usize,
}

impl WaitingQueue {
    pub fn new(match_size: usize) -> Self {
        Self {
            peers: VecDeque::new(),
            match_size: match_size.max(1),
        }
    }

    pub fn enqueue(&mut self, peer_id: PeerId) -> bool {
        if self.contains(peer_id) {
            return false;
        }
        self.peers.push_back((peer_id, Instant::now()));
        true
    }

    /// Puts peers back at the front, keeping their relative order.
    pub fn requeue_front(&mut self, peer_ids: &[PeerId]) {
        for &peer_id in peer_ids.iter().rev() {
            if !self.contains(peer_id) {
                self.peers.push_front((peer_id, Instant::now()));
            }
        }
    }

    pub fn dequeue(&mut self, peer_id: PeerId) -> bool {
        if let Some(pos) = self.peers.iter().position(|(id, _)| *id == peer_id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.iter().any(|(id, _)| *id == peer_id)
    }

    pub fn pop_match(&mut self) -> Option<Vec<PeerId>> {
        if self.peers.len() >= self.match_size {
            Some(
                self.peers
                    .drain(..self.match_size)
                    .map(|(id, _)| id)
                    .collect(),
            )
        } else {
            None
        }
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

    #[test]
    fn test_pop_match_takes_oldest() {
        let mut queue = WaitingQueue::new(2);
        queue.enqueue(1);
        assert!(queue.pop_match().is_none());
        queue.enqueue(2);
        queue.enqueue(3);
        assert!(!queue.enqueue(3));

        assert_eq!(queue.pop_match(), Some(vec![1, 2]));
        assert!(queue.contains(3));
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_match().is_none());
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut queue = WaitingQueue::new(2);
        queue.enqueue(5);
        queue.requeue_front(&[1, 2]);
        assert_eq!(queue.pop_match(), Some(vec![1, 2]));
        assert_eq!(queue.len(), 1);
        assert!(queue.dequeue(5));
        assert!(queue.is_empty());
    }
}
