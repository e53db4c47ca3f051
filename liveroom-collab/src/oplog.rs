//! Operation log and clock.
//!
//! Local operations get consecutive sequence numbers and stay in the pending
//! buffer until the authority acknowledges or rejects them. The buffer
//! survives disconnects; [`OpLog::rewind`] marks everything as unsent so the
//! next connection retransmits it in the original order.

use liveroom_core::{ActorId, ErrorKind, Operation};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpLogError {
    #[error("pending operation buffer is full ({capacity} operations)")]
    Full { capacity: usize },
    #[error("expected local sequence {expected}, got {got}")]
    OutOfSequence { expected: u64, got: u64 },
}

impl OpLogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Drains once the connection comes back.
            OpLogError::Full { .. } => ErrorKind::TransientNetwork,
            OpLogError::OutOfSequence { .. } => ErrorKind::Integrity,
        }
    }
}

/// Where a committed version sits relative to what has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Already applied.
    Stale,
    /// Exactly the next version.
    Next,
    /// Versions are missing in between.
    Gap,
}

#[derive(Debug)]
pub struct OpLog {
    actor: ActorId,
    next_seq: u64,
    pending: Vec<Operation>,
    /// Leading pending entries already written to the current connection.
    sent: usize,
    committed: u64,
    capacity: usize,
}

impl OpLog {
    pub fn new(actor: ActorId, capacity: usize) -> Self {
        Self {
            actor,
            next_seq: 1,
            pending: Vec::new(),
            sent: 0,
            committed: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Sequence number the next operation must carry.
    pub fn next_seq(&self) -> Result<u64, OpLogError> {
        if self.pending.len() >= self.capacity {
            return Err(OpLogError::Full { capacity: self.capacity });
        }
        Ok(self.next_seq)
    }

    pub fn append(&mut self, op: Operation) -> Result<(), OpLogError> {
        let expected = self.next_seq()?;
        if op.actor != self.actor || op.local_seq != expected {
            return Err(OpLogError::OutOfSequence { expected, got: op.local_seq });
        }
        self.next_seq += 1;
        self.pending.push(op);
        Ok(())
    }

    /// Operations not yet written to the current connection, oldest first.
    /// They count as sent afterwards.
    pub fn take_unsent(&mut self) -> Vec<Operation> {
        let unsent = self.pending[self.sent..].to_vec();
        self.sent = self.pending.len();
        unsent
    }

    pub fn unsent_len(&self) -> usize {
        self.pending.len() - self.sent
    }

    /// The connection dropped: everything pending goes out again.
    pub fn rewind(&mut self) {
        self.sent = 0;
    }

    /// The authority committed `seq`. Returns the operation if it was
    /// still pending.
    pub fn ack(&mut self, seq: u64) -> Option<Operation> {
        self.remove(seq)
    }

    pub fn reject(&mut self, seq: u64) -> Option<Operation> {
        self.remove(seq)
    }

    /// Drop every pending operation up to and including `seq`.
    pub fn ack_through(&mut self, seq: u64) -> usize {
        let before = self.pending.len();
        let dropped = self.pending.iter().take_while(|op| op.local_seq <= seq).count();
        self.pending.drain(..dropped);
        self.sent = self.sent.saturating_sub(dropped);
        before - self.pending.len()
    }

    fn remove(&mut self, seq: u64) -> Option<Operation> {
        let index = self.pending.iter().position(|op| op.local_seq == seq)?;
        if index < self.sent {
            self.sent -= 1;
        }
        Some(self.pending.remove(index))
    }

    pub fn pending(&self) -> &[Operation] {
        &self.pending
    }

    pub fn is_pending(&self, seq: u64) -> bool {
        self.pending.iter().any(|op| op.local_seq == seq)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Highest committed version applied locally.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn classify(&self, version: u64) -> Arrival {
        if version <= self.committed {
            Arrival::Stale
        } else if version == self.committed + 1 {
            Arrival::Next
        } else {
            Arrival::Gap
        }
    }

    pub fn set_committed(&mut self, version: u64) {
        self.committed = version;
    }
}
