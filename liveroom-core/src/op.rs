//! Document operations and their ordering stamps.

use crate::ids::{ActorId, NodeId};
use crate::position::Position;
use crate::value::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three container types a document is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    Object,
    List,
    Map,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContainerKind::Object => "object",
            ContainerKind::List => "list",
            ContainerKind::Map => "map",
        })
    }
}

/// Last-writer-wins ordering key.
///
/// Compared field by field: the authority's version first, then the actor id,
/// then the actor's local sequence. Operations that are still pending carry
/// `u64::MAX` as their version so they always sort after everything committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub version: u64,
    pub actor: ActorId,
    pub seq: u64,
}

impl Stamp {
    pub const ZERO: Stamp = Stamp { version: 0, actor: ActorId::NIL, seq: 0 };

    pub fn committed(version: u64, op: &Operation) -> Self {
        Self { version, actor: op.actor, seq: op.local_seq }
    }

    pub fn pending(op: &Operation) -> Self {
        Self { version: u64::MAX, actor: op.actor, seq: op.local_seq }
    }

    pub fn is_pending(&self) -> bool {
        self.version == u64::MAX
    }
}

/// A container created by an operation, with every id already assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInit {
    pub id: NodeId,
    pub body: InitBody,
}

impl NodeInit {
    pub fn kind(&self) -> ContainerKind {
        match self.body {
            InitBody::Object(_) => ContainerKind::Object,
            InitBody::Map(_) => ContainerKind::Map,
            InitBody::List(_) => ContainerKind::List,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InitBody {
    Object(Vec<(String, NewValue)>),
    Map(Vec<(String, NewValue)>),
    List(Vec<InitItem>),
}

/// A list item inside a freshly created list. When the item holds a
/// container, that container's id equals the item id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitItem {
    pub id: NodeId,
    pub position: Position,
    pub value: NewValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NewValue {
    Scalar(Json),
    Node(NodeInit),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpPayload {
    /// Write a field of an Object or an entry of a Map.
    Set { key: String, value: NewValue },
    /// Clear a field of an Object or an entry of a Map.
    Remove { key: String },
    /// Add an item to a List.
    Insert { item: NodeId, position: Position, value: NewValue },
    /// Give a List item a new position.
    Move { item: NodeId, position: Position },
    /// Tombstone a List item.
    Delete { item: NodeId },
}

impl OpPayload {
    pub fn name(&self) -> &'static str {
        match self {
            OpPayload::Set { .. } => "set",
            OpPayload::Remove { .. } => "remove",
            OpPayload::Insert { .. } => "insert",
            OpPayload::Move { .. } => "move",
            OpPayload::Delete { .. } => "delete",
        }
    }
}

/// One atomic document mutation.
///
/// `(actor, local_seq)` identifies the operation for its whole life; the
/// authority adds a global version when it commits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub actor: ActorId,
    pub local_seq: u64,
    pub target: NodeId,
    pub payload: OpPayload,
}

impl Operation {
    pub fn new(actor: ActorId, local_seq: u64, target: NodeId, payload: OpPayload) -> Self {
        Self { actor, local_seq, target, payload }
    }

    /// Whether `other` is the same logical operation.
    pub fn same_origin(&self, actor: ActorId, local_seq: u64) -> bool {
        self.actor == actor && self.local_seq == local_seq
    }
}
