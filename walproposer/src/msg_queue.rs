//! FIFO of in-flight WAL records with per-safekeeper ack bookkeeping.

use bytes::Bytes;
use std::collections::VecDeque;
use utils::lsn::Lsn;

/// One WAL record accepted from the primary and not yet confirmed by every
/// safekeeper. `data` is the full `'w'` frame with the end-position field
/// already patched to `wal_end`.
#[derive(Debug, Clone)]
pub struct WalMessage {
    pub data: Bytes,
    pub wal_pos: Lsn,
    pub wal_end: Lsn,
    pub ack_mask: u64,
}

/// In-flight record queue. Records enter in LSN order, collect ack bits as
/// safekeepers report progress and leave from the front once everyone has
/// confirmed them.
pub struct MessageQueue {
    msgs: VecDeque<WalMessage>,
    n_safekeepers: usize,
}

impl MessageQueue {
    pub fn new(n_safekeepers: usize) -> MessageQueue {
        assert!(
            n_safekeepers > 0 && n_safekeepers <= crate::protocol::MAX_SAFEKEEPERS,
            "invalid safekeeper count {n_safekeepers}"
        );
        MessageQueue {
            msgs: VecDeque::new(),
            n_safekeepers,
        }
    }

    fn full_mask(&self) -> u64 {
        if self.n_safekeepers == 64 {
            u64::MAX
        } else {
            (1 << self.n_safekeepers) - 1
        }
    }

    /// Append a record. Positions must be strictly increasing along the queue.
    pub fn enqueue(&mut self, msg: WalMessage) {
        if let Some(tail) = self.msgs.back() {
            debug_assert!(msg.wal_pos > tail.wal_pos, "WAL positions must grow");
        }
        self.msgs.push_back(msg);
    }

    /// Safekeeper `i` confirmed everything up to `lsn`: set its ack bit on
    /// every record that ends at or before `lsn` and drop the longest
    /// fully-acknowledged prefix. Returns the number of pruned records.
    pub fn mark_acked(&mut self, i: usize, lsn: Lsn) -> usize {
        debug_assert!(i < self.n_safekeepers);
        for msg in self.msgs.iter_mut() {
            if msg.wal_end > lsn {
                break;
            }
            msg.ack_mask |= 1 << i;
        }

        let full = self.full_mask();
        let mut pruned = 0;
        while matches!(self.msgs.front(), Some(m) if m.ack_mask == full) {
            self.msgs.pop_front();
            pruned += 1;
        }
        pruned
    }

    /// Oldest record safekeeper `i` has not acknowledged yet, if any.
    pub fn next_unacked(&self, i: usize) -> Option<&WalMessage> {
        debug_assert!(i < self.n_safekeepers);
        self.msgs.iter().find(|m| m.ack_mask & (1 << i) == 0)
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }
}

/// Highest LSN confirmed by at least `quorum` of the given positions: sort
/// ascending and take the element `quorum` places from the top. Equal values
/// count separately, so the result is well defined across ties.
pub fn quorum_lsn(ack_positions: &[Lsn], quorum: usize) -> Lsn {
    assert!(quorum > 0 && quorum <= ack_positions.len());
    let mut acks = ack_positions.to_vec();
    acks.sort_unstable();
    acks[acks.len() - quorum]
}
