use std::collections::HashMap;
use std::net::SocketAddr;

use super::protocol::{MessageType, sequence_greater_than};

/// Order numbers handed out per `(remote, type)` start here.
pub const FIRST_ORDER: u32 = 1;

/// Outcome of checking one inbound ordered envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    /// Not newer than the last accepted order: a duplicate or a stale copy.
    Stale,
    /// Newer, but its parity says a message in between went missing.
    OutOfPhase,
}

/// Duplicate and stale rejection for ordered envelopes.
///
/// Each remote owns one row. A row stores one parity bit per message type,
/// packed into a single word: a set bit means the next acceptable order number
/// is odd. An envelope is accepted when its order parity matches the bit,
/// which then flips. This catches duplicates and one-step reorders; a gap of
/// one lost message makes the following message look out of phase, and the
/// one after that resynchronises. The last accepted order per cell guards
/// against stale envelopes that happen to have the expected parity.
///
/// Reliable envelopes are retransmitted with the same order number until
/// acknowledged, so an out-of-phase reliable envelope is never dropped; the
/// receiver [`resync`](OrderingFilter::resync)s to it instead.
///
/// Rows are reclaimed on leave and handed to the next remote that joins.
/// Outbound order counters are kept apart from rows, so sending to a remote
/// never starts filtering what it sends back.
#[derive(Debug, Default)]
pub struct OrderingFilter {
    rows: HashMap<SocketAddr, usize>,
    free_rows: Vec<usize>,
    parity: Vec<u64>,
    last_accepted: Vec<u32>,
    next_outbound: HashMap<(SocketAddr, MessageType), u32>,
}

impl OrderingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn columns() -> usize {
        MessageType::count()
    }

    fn initial_parity() -> u64 {
        // FIRST_ORDER is odd, so every cell starts expecting odd.
        if MessageType::count() >= 64 {
            u64::MAX
        } else {
            (1u64 << MessageType::count()) - 1
        }
    }

    fn clear_row(&mut self, row: usize) {
        let cols = Self::columns();
        self.parity[row] = Self::initial_parity();
        self.last_accepted[row * cols..(row + 1) * cols].fill(0);
    }

    /// Allocates (or reuses) a row for `addr`. Joining twice keeps the row.
    pub fn join(&mut self, addr: SocketAddr) -> usize {
        if let Some(&row) = self.rows.get(&addr) {
            return row;
        }

        let row = match self.free_rows.pop() {
            Some(row) => row,
            None => {
                let cols = Self::columns();
                self.parity.push(0);
                self.last_accepted.extend(std::iter::repeat_n(0, cols));
                self.parity.len() - 1
            }
        };
        self.clear_row(row);
        self.rows.insert(addr, row);
        row
    }

    /// Clears the remote's row and makes it available for reuse. Outbound
    /// counters for the remote restart as well.
    pub fn leave(&mut self, addr: &SocketAddr) -> bool {
        self.next_outbound.retain(|(a, _), _| a != addr);
        let Some(row) = self.rows.remove(addr) else {
            return false;
        };
        self.clear_row(row);
        self.free_rows.push(row);
        true
    }

    pub fn row_of(&self, addr: &SocketAddr) -> Option<usize> {
        self.rows.get(addr).copied()
    }

    pub fn allocated_rows(&self) -> usize {
        self.parity.len()
    }

    pub fn has_state_for(&self, addr: &SocketAddr) -> bool {
        self.rows.contains_key(addr) || self.next_outbound.keys().any(|(a, _)| a == addr)
    }

    /// The order number the next envelope of this type to `addr` will carry.
    pub fn peek_order(&self, addr: SocketAddr, message_type: MessageType) -> u32 {
        self.next_outbound
            .get(&(addr, message_type))
            .copied()
            .unwrap_or(FIRST_ORDER)
    }

    /// Stamps the next outbound order number for `(addr, message_type)`.
    pub fn next_order(&mut self, addr: SocketAddr, message_type: MessageType) -> u32 {
        let next = self
            .next_outbound
            .entry((addr, message_type))
            .or_insert(FIRST_ORDER);
        let order = *next;
        *next = order.wrapping_add(1);
        order
    }

    /// Checks an inbound ordered envelope and records it when accepted.
    /// Envelopes from remotes without a row are accepted unfiltered.
    pub fn check(&mut self, addr: &SocketAddr, message_type: MessageType, order: u32) -> Verdict {
        let Some(&row) = self.rows.get(addr) else {
            return Verdict::Accepted;
        };
        let col = message_type.index();
        let cell = row * Self::columns() + col;

        if !sequence_greater_than(order, self.last_accepted[cell]) {
            return Verdict::Stale;
        }

        let expect_odd = self.parity[row] & (1 << col) != 0;
        let is_odd = order & 1 == 1;
        if expect_odd != is_odd {
            return Verdict::OutOfPhase;
        }

        self.parity[row] ^= 1 << col;
        self.last_accepted[cell] = order;
        Verdict::Accepted
    }

    /// Accepts `order` regardless of parity. The cell then expects the
    /// parity following it.
    pub fn resync(&mut self, addr: &SocketAddr, message_type: MessageType, order: u32) {
        let Some(&row) = self.rows.get(addr) else {
            return;
        };
        let col = message_type.index();
        if order & 1 == 1 {
            self.parity[row] &= !(1 << col);
        } else {
            self.parity[row] |= 1 << col;
        }
        self.last_accepted[row * Self::columns() + col] = order;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let mut filter = OrderingFilter::new();
        filter.join(addr(1));

        let accepted = [1, 2, 3, 3, 4]
            .iter()
            .filter(|&&order| {
                filter.check(&addr(1), MessageType::Chat, order) == Verdict::Accepted
            })
            .count();
        assert_eq!(accepted, 4);
    }

    #[test]
    fn test_stale_is_rejected() {
        let mut filter = OrderingFilter::new();
        filter.join(addr(1));

        assert_eq!(filter.check(&addr(1), MessageType::Chat, 1), Verdict::Accepted);
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 2), Verdict::Accepted);
        assert_ne!(filter.check(&addr(1), MessageType::Chat, 1), Verdict::Accepted);
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 3), Verdict::Accepted);
    }

    #[test]
    fn test_single_gap_drops_next_then_resyncs() {
        let mut filter = OrderingFilter::new();
        filter.join(addr(1));

        assert_eq!(filter.check(&addr(1), MessageType::Spawn, 1), Verdict::Accepted);
        // 2 lost; 3 has the wrong parity.
        assert_ne!(filter.check(&addr(1), MessageType::Spawn, 3), Verdict::Accepted);
        assert_eq!(filter.check(&addr(1), MessageType::Spawn, 4), Verdict::Accepted);
        assert_eq!(filter.check(&addr(1), MessageType::Spawn, 5), Verdict::Accepted);
    }

    #[test]
    fn test_types_and_peers_are_independent() {
        let mut filter = OrderingFilter::new();
        filter.join(addr(1));
        filter.join(addr(2));

        assert_eq!(filter.check(&addr(1), MessageType::Chat, 1), Verdict::Accepted);
        assert_eq!(filter.check(&addr(1), MessageType::Spawn, 1), Verdict::Accepted);
        assert_eq!(filter.check(&addr(2), MessageType::Chat, 1), Verdict::Accepted);
        assert_ne!(filter.check(&addr(2), MessageType::Chat, 1), Verdict::Accepted);
    }

    #[test]
    fn test_rows_are_reused_after_leave() {
        let mut filter = OrderingFilter::new();
        let row = filter.join(addr(1));
        filter.join(addr(2));
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 1), Verdict::Accepted);

        assert!(filter.leave(&addr(1)));
        assert!(!filter.leave(&addr(1)));
        assert_eq!(filter.join(addr(3)), row);
        assert_eq!(filter.allocated_rows(), 2);

        // The reused row starts fresh.
        assert_eq!(filter.check(&addr(3), MessageType::Chat, 1), Verdict::Accepted);
    }

    #[test]
    fn test_outbound_orders_are_per_remote_and_type() {
        let mut filter = OrderingFilter::new();
        assert_eq!(filter.next_order(addr(1), MessageType::Chat), 1);
        assert_eq!(filter.next_order(addr(1), MessageType::Chat), 2);
        assert_eq!(filter.next_order(addr(1), MessageType::Spawn), 1);
        assert_eq!(filter.next_order(addr(2), MessageType::Chat), 1);

        // Sending does not start inbound filtering.
        assert_eq!(filter.row_of(&addr(1)), None);
        assert!(filter.has_state_for(&addr(1)));

        filter.leave(&addr(1));
        assert!(!filter.has_state_for(&addr(1)));
        assert_eq!(filter.next_order(addr(1), MessageType::Chat), 1);
    }

    #[test]
    fn test_verdict_tells_stale_from_out_of_phase() {
        let mut filter = OrderingFilter::new();
        filter.join(addr(1));

        assert_eq!(filter.check(&addr(1), MessageType::Chat, 1), Verdict::Accepted);
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 1), Verdict::Stale);
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 3), Verdict::OutOfPhase);
        // A rejected envelope leaves the cell untouched.
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 2), Verdict::Accepted);
    }

    #[test]
    fn test_resync_follows_the_accepted_order() {
        let mut filter = OrderingFilter::new();
        filter.join(addr(1));

        assert_eq!(filter.check(&addr(1), MessageType::Chat, 1), Verdict::Accepted);
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 3), Verdict::OutOfPhase);
        filter.resync(&addr(1), MessageType::Chat, 3);
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 3), Verdict::Stale);
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 4), Verdict::Accepted);
        assert_eq!(filter.check(&addr(1), MessageType::Chat, 5), Verdict::Accepted);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut filter = OrderingFilter::new();
        assert_eq!(filter.peek_order(addr(1), MessageType::Chat), FIRST_ORDER);
        assert!(!filter.has_state_for(&addr(1)));
        assert_eq!(filter.next_order(addr(1), MessageType::Chat), FIRST_ORDER);
        assert_eq!(filter.peek_order(addr(1), MessageType::Chat), FIRST_ORDER + 1);
    }

    #[test]
    fn test_unknown_sender_is_unfiltered() {
        let mut filter = OrderingFilter::new();
        assert_eq!(filter.check(&addr(7), MessageType::Chat, 5), Verdict::Accepted);
        assert_eq!(filter.check(&addr(7), MessageType::Chat, 5), Verdict::Accepted);
    }
}
