//! Actor and node identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one replica writing into a room.
///
/// A fresh actor id is minted for every room instance, so `(actor, local_seq)`
/// pairs never repeat even when a room is left and entered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub Uuid);

impl ActorId {
    /// The actor that owns the root container.
    pub const NIL: ActorId = ActorId(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic actor id (for testing).
    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Identity of a container node or list item.
///
/// Minted by the replica that creates the node (`actor` + per-replica
/// counter). The node only becomes part of the shared tree once the authority
/// commits the creating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub actor: ActorId,
    pub counter: u64,
}

impl NodeId {
    /// The single root Object of every room.
    pub const ROOT: NodeId = NodeId { actor: ActorId::NIL, counter: 0 };

    pub fn new(actor: ActorId, counter: u64) -> Self {
        Self { actor, counter }
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("root")
        } else {
            write!(f, "{}:{}", self.actor, self.counter)
        }
    }
}

/// Mints node ids for one actor.
#[derive(Debug, Clone)]
pub struct IdGen {
    actor: ActorId,
    next: u64,
}

impl IdGen {
    pub fn new(actor: ActorId) -> Self {
        Self { actor, next: 1 }
    }

    pub fn next_id(&mut self) -> NodeId {
        let id = NodeId::new(self.actor, self.next);
        self.next += 1;
        id
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }
}
