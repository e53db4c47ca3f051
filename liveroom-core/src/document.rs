//! The CRDT document engine.
//!
//! A `Document` keeps two trees:
//! - `committed`: every operation the authority has ordered, applied in
//!   version order;
//! - `visible`: `committed` plus the still-pending local operations applied
//!   on top, in local sequence order.
//!
//! Whenever the committed tree changes underneath pending work the visible
//! tree is rebuilt, so a pending operation's speculative effect is replaced by
//! its authoritative one rather than applied twice.

use crate::error::ErrorKind;
use crate::history::{History, DEFAULT_MAX_DEPTH};
use crate::ids::{ActorId, IdGen, NodeId};
use crate::op::{ContainerKind, InitBody, InitItem, NewValue, NodeInit, OpPayload, Operation, Stamp};
use crate::position::Position;
use crate::tree::{ApplyError, ListItem, Node, Tree};
use crate::value::{Input, Json, LiveNode};
use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("node {0} has been deleted")]
    DeletedNode(NodeId),
    #[error("node {id} is not a {expected}")]
    KindMismatch { id: NodeId, expected: ContainerKind },
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("replica out of sync: {source}")]
    Inconsistent {
        #[from]
        source: ApplyError,
    },
}

impl DocumentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocumentError::Inconsistent { .. } => ErrorKind::ProtocolInconsistency,
            _ => ErrorKind::Integrity,
        }
    }
}

pub struct Document {
    ids: IdGen,
    committed: Tree,
    visible: Tree,
    version: u64,
    /// `visible` carries effects of pending operations.
    speculative: bool,
    history: History,
}

impl Document {
    pub fn new(actor: ActorId) -> Self {
        Self::with_history_depth(actor, DEFAULT_MAX_DEPTH)
    }

    pub fn with_history_depth(actor: ActorId, depth: usize) -> Self {
        Self {
            ids: IdGen::new(actor),
            committed: Tree::new(),
            visible: Tree::new(),
            version: 0,
            speculative: false,
            history: History::new(depth),
        }
    }

    pub fn actor(&self) -> ActorId {
        self.ids.actor()
    }

    /// Highest committed version applied.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// What consumers see: committed state plus pending local edits.
    pub fn snapshot(&self) -> LiveNode {
        self.visible.to_live()
    }

    pub fn committed_snapshot(&self) -> LiveNode {
        self.committed.to_live()
    }

    pub fn committed_tree(&self) -> &Tree {
        &self.committed
    }

    pub fn visible_tree(&self) -> &Tree {
        &self.visible
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }

    /// Number of visible items in a list.
    pub fn list_len(&self, list: NodeId) -> Result<usize, DocumentError> {
        self.live(list, ContainerKind::List)?;
        Ok(self.visible.visible_items(list).len())
    }

    // ---- payload builders -------------------------------------------------
    //
    // These validate against the visible tree and mint ids, but change
    // nothing. The caller wraps the payload in an `Operation` and passes it to
    // `apply_local`.

    pub fn prepare_set(&mut self, target: NodeId, key: &str, value: Input) -> Result<OpPayload, DocumentError> {
        self.live_keyed(target)?;
        Ok(OpPayload::Set { key: key.to_string(), value: new_value(value, &mut self.ids, None) })
    }

    pub fn prepare_remove(&self, target: NodeId, key: &str) -> Result<OpPayload, DocumentError> {
        self.live_keyed(target)?;
        Ok(OpPayload::Remove { key: key.to_string() })
    }

    pub fn prepare_insert(&mut self, list: NodeId, index: usize, value: Input) -> Result<OpPayload, DocumentError> {
        self.live(list, ContainerKind::List)?;
        let items = self.visible.visible_items(list);
        if index > items.len() {
            return Err(DocumentError::IndexOutOfBounds { index, len: items.len() });
        }
        let position = position_at(&items, index);
        let item = self.ids.next_id();
        let value = new_value(value, &mut self.ids, Some(item));
        Ok(OpPayload::Insert { item, position, value })
    }

    pub fn prepare_push(&mut self, list: NodeId, value: Input) -> Result<OpPayload, DocumentError> {
        let len = self.list_len(list)?;
        self.prepare_insert(list, len, value)
    }

    /// Move the item at `from` so it ends up at index `to`.
    pub fn prepare_move(&self, list: NodeId, from: usize, to: usize) -> Result<OpPayload, DocumentError> {
        self.live(list, ContainerKind::List)?;
        let mut items = self.visible.visible_items(list);
        let len = items.len();
        if from >= len {
            return Err(DocumentError::IndexOutOfBounds { index: from, len });
        }
        if to >= len {
            return Err(DocumentError::IndexOutOfBounds { index: to, len });
        }
        let moving = items.remove(from);
        Ok(OpPayload::Move { item: moving.id, position: position_at(&items, to) })
    }

    pub fn prepare_delete(&self, list: NodeId, index: usize) -> Result<OpPayload, DocumentError> {
        self.live(list, ContainerKind::List)?;
        let items = self.visible.visible_items(list);
        let item = items
            .get(index)
            .ok_or(DocumentError::IndexOutOfBounds { index, len: items.len() })?;
        Ok(OpPayload::Delete { item: item.id })
    }

    // ---- applying ---------------------------------------------------------

    /// Apply a local operation speculatively and return its inverse.
    pub fn apply_local(&mut self, op: &Operation) -> Result<(NodeId, OpPayload), DocumentError> {
        let inverse = self.visible.inverse(op.target, &op.payload, &mut self.ids)?;
        self.visible.apply(op, Stamp::pending(op))?;
        self.speculative = true;
        Ok(inverse)
    }

    /// Apply an operation the authority committed at `version`.
    ///
    /// `pending` is the local operations still awaiting acknowledgment, in
    /// sequence order. On error nothing changes and the caller should
    /// resynchronise.
    pub fn apply_committed(&mut self, version: u64, op: &Operation, pending: &[Operation]) -> Result<(), DocumentError> {
        let stamp = Stamp::committed(version, op);
        self.committed.apply(op, stamp)?;
        self.version = version;

        if self.speculative || !pending.is_empty() {
            self.rebuild(pending);
        } else if let Err(e) = self.visible.apply(op, stamp) {
            warn!("visible tree diverged from committed tree ({e}), rebuilding");
            self.rebuild(pending);
        }
        Ok(())
    }

    /// Replace the committed tree with an authoritative snapshot.
    pub fn reset(&mut self, version: u64, tree: Tree, pending: &[Operation]) {
        debug!("document reset to version {version} ({} nodes)", tree.len());
        self.committed = tree;
        self.version = version;
        self.rebuild(pending);
    }

    /// Recompute the visible tree from the committed one.
    pub fn rebuild(&mut self, pending: &[Operation]) {
        let mut visible = self.committed.clone();
        for op in pending {
            if let Err(e) = visible.apply(op, Stamp::pending(op)) {
                warn!("pending op {}#{} no longer applies: {e}", op.actor, op.local_seq);
            }
        }
        self.visible = visible;
        self.speculative = !pending.is_empty();
    }

    /// Drop tombstones every replica has seen.
    pub fn compact(&mut self, watermark: u64) {
        let removed = self.committed.compact(watermark);
        self.visible.compact(watermark);
        if removed > 0 {
            debug!("compacted {removed} nodes up to version {watermark}");
        }
    }

    fn live(&self, id: NodeId, expected: ContainerKind) -> Result<&Node, DocumentError> {
        let node = self.live_node(id)?;
        if node.body.kind() != expected {
            return Err(DocumentError::KindMismatch { id, expected });
        }
        Ok(node)
    }

    fn live_keyed(&self, id: NodeId) -> Result<&Node, DocumentError> {
        let node = self.live_node(id)?;
        match node.body.kind() {
            ContainerKind::List => Err(DocumentError::KindMismatch { id, expected: ContainerKind::Object }),
            _ => Ok(node),
        }
    }

    fn live_node(&self, id: NodeId) -> Result<&Node, DocumentError> {
        let node = self.visible.node(id).ok_or(DocumentError::UnknownNode(id))?;
        if !self.visible.is_live(id) {
            return Err(DocumentError::DeletedNode(id));
        }
        Ok(node)
    }
}

/// Position for a new item at `index` among `items`.
fn position_at(items: &[&ListItem], index: usize) -> Position {
    let lo = index.checked_sub(1).and_then(|i| items.get(i)).map(|i| &i.position);
    let hi = items.get(index).map(|i| &i.position);
    Position::between(lo, hi)
}

fn new_value(input: Input, ids: &mut IdGen, id: Option<NodeId>) -> NewValue {
    let assign = |ids: &mut IdGen| id.unwrap_or_else(|| ids.next_id());
    match input {
        Input::Scalar(v) => NewValue::Scalar(Json(v)),
        Input::Object(fields) => {
            let id = assign(ids);
            NewValue::Node(NodeInit { id, body: InitBody::Object(new_fields(fields, ids)) })
        }
        Input::Map(entries) => {
            let id = assign(ids);
            NewValue::Node(NodeInit { id, body: InitBody::Map(new_fields(entries, ids)) })
        }
        Input::List(items) => {
            let id = assign(ids);
            let mut out = Vec::with_capacity(items.len());
            let mut position = Position::first();
            for (i, item) in items.into_iter().enumerate() {
                if i > 0 {
                    position = Position::after(&position);
                }
                let item_id = ids.next_id();
                out.push(InitItem {
                    id: item_id,
                    position: position.clone(),
                    value: new_value(item, ids, Some(item_id)),
                });
            }
            NewValue::Node(NodeInit { id, body: InitBody::List(out) })
        }
    }
}

fn new_fields(fields: Vec<(String, Input)>, ids: &mut IdGen) -> Vec<(String, NewValue)> {
    let mut out: Vec<(String, NewValue)> = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        let value = new_value(value, ids, None);
        // Last occurrence of a repeated key wins.
        match out.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => out.push((key, value)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Replica {
        doc: Document,
        seq: u64,
        pending: Vec<Operation>,
    }

    impl Replica {
        fn new(n: u128) -> Self {
            Self { doc: Document::new(ActorId::from_u128(n)), seq: 0, pending: Vec::new() }
        }

        fn local(&mut self, target: NodeId, payload: OpPayload) -> Operation {
            self.seq += 1;
            let op = Operation::new(self.doc.actor(), self.seq, target, payload);
            let (t, inv) = self.doc.apply_local(&op).unwrap();
            self.doc.history_mut().record(t, inv);
            self.pending.push(op.clone());
            op
        }

        fn commit(&mut self, version: u64, op: &Operation) {
            self.pending.retain(|p| !p.same_origin(op.actor, op.local_seq));
            self.doc.apply_committed(version, op, &self.pending).unwrap();
        }
    }

    #[test]
    fn test_offline_set_commits_at_authority_version() {
        let mut a = Replica::new(1);
        let mut b = Replica::new(2);
        for v in 1..=4 {
            let payload = b.doc.prepare_set(NodeId::ROOT, "warmup", Input::scalar(v)).unwrap();
            let op = b.local(NodeId::ROOT, payload);
            a.commit(v, &op);
            b.commit(v, &op);
        }

        let payload = a.doc.prepare_set(NodeId::ROOT, "count", Input::scalar(1)).unwrap();
        let op = a.local(NodeId::ROOT, payload);
        assert_eq!(a.doc.snapshot().get("count").and_then(|v| v.as_scalar()), Some(&json!(1)));
        assert!(a.doc.committed_snapshot().get("count").is_none());

        a.commit(5, &op);
        b.commit(5, &op);
        assert!(a.pending.is_empty());
        assert_eq!(a.doc.version(), 5);
        assert_eq!(b.doc.snapshot(), a.doc.snapshot());
        assert_eq!(b.doc.snapshot().get("count").and_then(|v| v.as_scalar()), Some(&json!(1)));
    }

    #[test]
    fn test_pending_write_stays_on_top_of_remote_writes() {
        let mut a = Replica::new(1);
        let mut b = Replica::new(2);
        let pa = a.doc.prepare_set(NodeId::ROOT, "k", Input::scalar("a")).unwrap();
        let op_a = a.local(NodeId::ROOT, pa);
        let pb = b.doc.prepare_set(NodeId::ROOT, "k", Input::scalar("b")).unwrap();
        let op_b = b.local(NodeId::ROOT, pb);

        // Authority orders b first.
        a.commit(1, &op_b);
        assert_eq!(a.doc.snapshot().to_json(), json!({"k": "a"}));
        a.commit(2, &op_a);
        b.commit(1, &op_b);
        b.commit(2, &op_a);
        assert_eq!(a.doc.snapshot().to_json(), json!({"k": "a"}));
        assert_eq!(a.doc.snapshot(), b.doc.snapshot());
    }

    #[test]
    fn test_nested_containers_and_list_edits() {
        let mut a = Replica::new(1);
        let payload = a
            .doc
            .prepare_set(NodeId::ROOT, "todo", Input::from(json!({"items": ["x", "y"]})))
            .unwrap();
        a.local(NodeId::ROOT, payload);

        let snapshot = a.doc.snapshot();
        let todo = snapshot.get("todo").and_then(|v| v.as_node()).unwrap();
        let list = todo.get("items").and_then(|v| v.as_node()).unwrap().id();
        assert_eq!(a.doc.list_len(list).unwrap(), 2);

        let ins = a.doc.prepare_insert(list, 1, Input::scalar("mid")).unwrap();
        a.local(list, ins);
        let mv = a.doc.prepare_move(list, 0, 2).unwrap();
        a.local(list, mv);
        let del = a.doc.prepare_delete(list, 0).unwrap();
        a.local(list, del);
        assert_eq!(a.doc.snapshot().to_json(), json!({"todo": {"items": ["y", "x"]}}));
    }

    #[test]
    fn test_builders_validate_targets() {
        let mut a = Replica::new(1);
        let missing = NodeId::new(ActorId::from_u128(9), 9);
        assert_eq!(
            a.doc.prepare_set(missing, "k", Input::scalar(1)),
            Err(DocumentError::UnknownNode(missing))
        );
        assert!(matches!(
            a.doc.prepare_delete(NodeId::ROOT, 0),
            Err(DocumentError::KindMismatch { expected: ContainerKind::List, .. })
        ));

        let payload = a.doc.prepare_set(NodeId::ROOT, "l", Input::List(Vec::new())).unwrap();
        a.local(NodeId::ROOT, payload);
        let list = a.doc.snapshot().get("l").and_then(|v| v.as_node()).unwrap().id();
        assert_eq!(
            a.doc.prepare_insert(list, 1, Input::scalar(1)),
            Err(DocumentError::IndexOutOfBounds { index: 1, len: 0 })
        );

        let clear = a.doc.prepare_set(NodeId::ROOT, "l", Input::scalar(0)).unwrap();
        a.local(NodeId::ROOT, clear);
        assert_eq!(a.doc.prepare_push(list, Input::scalar(1)), Err(DocumentError::DeletedNode(list)));
        assert_eq!(DocumentError::DeletedNode(list).kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_invalid_committed_op_leaves_document_untouched() {
        let mut a = Replica::new(1);
        let bogus = Operation::new(
            ActorId::from_u128(2),
            1,
            NodeId::new(ActorId::from_u128(2), 77),
            OpPayload::Remove { key: "k".into() },
        );
        let before = a.doc.snapshot();
        let err = a.doc.apply_committed(1, &bogus, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolInconsistency);
        assert_eq!(a.doc.version(), 0);
        assert_eq!(a.doc.snapshot(), before);
    }

    #[test]
    fn test_reset_reapplies_pending() {
        let mut a = Replica::new(1);
        let payload = a.doc.prepare_set(NodeId::ROOT, "mine", Input::scalar(true)).unwrap();
        a.local(NodeId::ROOT, payload);

        let mut authoritative = Tree::new();
        let remote = Operation::new(
            ActorId::from_u128(2),
            1,
            NodeId::ROOT,
            OpPayload::Set { key: "theirs".into(), value: NewValue::Scalar(Json(json!(1))) },
        );
        authoritative.apply(&remote, Stamp::committed(10, &remote)).unwrap();

        a.doc.reset(10, authoritative, &a.pending);
        assert_eq!(a.doc.version(), 10);
        assert_eq!(a.doc.snapshot().to_json(), json!({"mine": true, "theirs": 1}));
        assert_eq!(a.doc.committed_snapshot().to_json(), json!({"theirs": 1}));
    }
}
