//! The replicated container tree.
//!
//! `Tree` stores every container node by id. Children are referenced by id
//! from their parent's body; `Node::parent` is a lookup edge only. Deleted
//! nodes and list items stay in place as tombstones until [`Tree::compact`]
//! drops them.
//!
//! Conflict resolution:
//! - Object/Map fields are last-writer-wins on [`Stamp`].
//! - List items are ordered by `(position, id)`; moves are last-writer-wins.
//! - Deletes always win and are kept as tombstones.

use crate::ids::{IdGen, NodeId};
use crate::op::{ContainerKind, InitBody, InitItem, NewValue, NodeInit, OpPayload, Operation, Stamp};
use crate::position::Position;
use crate::value::{Json, LiveItem, LiveNode, LiveValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Why an operation could not be applied to a tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("list {list} has no item {item}")]
    UnknownItem { list: NodeId, item: NodeId },
    #[error("{op} does not apply to {kind} node {id}")]
    KindMismatch { id: NodeId, kind: ContainerKind, op: &'static str },
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),
    #[error("malformed container {0}")]
    MalformedInit(NodeId),
    #[error("item {item} of list {list} has an invalid position")]
    InvalidPosition { list: NodeId, item: NodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Slot {
    Scalar(Json),
    Node(NodeId),
}

/// A field or map entry. `value == None` is a removal tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub value: Option<Slot>,
    pub stamp: Stamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: NodeId,
    pub position: Position,
    pub value: Slot,
    /// Stamp of the write that last set `position`.
    pub moved: Stamp,
    pub deleted: Option<Stamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Object(BTreeMap<String, Field>),
    Map(BTreeMap<String, Field>),
    /// Kept sorted by `(position, id)`.
    List(Vec<ListItem>),
}

impl Body {
    pub fn kind(&self) -> ContainerKind {
        match self {
            Body::Object(_) => ContainerKind::Object,
            Body::Map(_) => ContainerKind::Map,
            Body::List(_) => ContainerKind::List,
        }
    }

    fn children(&self) -> Vec<NodeId> {
        let slot_child = |slot: &Slot| match slot {
            Slot::Node(id) => Some(*id),
            Slot::Scalar(_) => None,
        };
        match self {
            Body::Object(fields) | Body::Map(fields) => fields
                .values()
                .filter_map(|f| f.value.as_ref().and_then(slot_child))
                .collect(),
            Body::List(items) => items.iter().filter_map(|i| slot_child(&i.value)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub body: Body,
    pub deleted: Option<Stamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: HashMap<NodeId, Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// A tree holding only the empty root Object.
    pub fn new() -> Self {
        let root = Node {
            id: NodeId::ROOT,
            parent: None,
            body: Body::Object(BTreeMap::new()),
            deleted: None,
        };
        Self { nodes: HashMap::from([(NodeId::ROOT, root)]) }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the node exists and neither it nor any ancestor is deleted.
    pub fn is_live(&self, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(id) = cursor {
            match self.nodes.get(&id) {
                Some(node) if node.deleted.is_none() => cursor = node.parent,
                _ => return false,
            }
        }
        true
    }

    /// Non-deleted items of a list, in order.
    pub fn visible_items(&self, list: NodeId) -> Vec<&ListItem> {
        match self.nodes.get(&list).map(|n| &n.body) {
            Some(Body::List(items)) => items.iter().filter(|i| i.deleted.is_none()).collect(),
            _ => Vec::new(),
        }
    }

    /// Apply one operation under the given stamp.
    ///
    /// Either the whole operation takes effect or, on error, nothing does.
    pub fn apply(&mut self, op: &Operation, stamp: Stamp) -> Result<(), ApplyError> {
        let target = op.target;
        let kind = self
            .nodes
            .get(&target)
            .map(|n| n.body.kind())
            .ok_or(ApplyError::UnknownNode(target))?;
        let mismatch = || ApplyError::KindMismatch { id: target, kind, op: op.payload.name() };

        match &op.payload {
            OpPayload::Set { key, value } => {
                if kind == ContainerKind::List {
                    return Err(mismatch());
                }
                if let NewValue::Node(init) = value {
                    self.validate_init(init, &mut HashSet::new())?;
                }
                self.write_field(target, key, Some(value), stamp);
                Ok(())
            }
            OpPayload::Remove { key } => {
                if kind == ContainerKind::List {
                    return Err(mismatch());
                }
                self.write_field(target, key, None, stamp);
                Ok(())
            }
            OpPayload::Insert { item, position, value } => {
                if kind != ContainerKind::List {
                    return Err(mismatch());
                }
                if !position.is_valid() {
                    return Err(ApplyError::InvalidPosition { list: target, item: *item });
                }
                if self.find_item(target, *item).is_some() {
                    return Err(ApplyError::DuplicateNode(*item));
                }
                if let NewValue::Node(init) = value {
                    if init.id != *item {
                        return Err(ApplyError::MalformedInit(init.id));
                    }
                    self.validate_init(init, &mut HashSet::new())?;
                }
                let slot = self.materialize_value(value, target, stamp);
                let entry = ListItem {
                    id: *item,
                    position: position.clone(),
                    value: slot,
                    moved: stamp,
                    deleted: None,
                };
                if let Some(Body::List(items)) = self.body_mut(target) {
                    insert_sorted(items, entry);
                }
                Ok(())
            }
            OpPayload::Move { item, position } => {
                if kind != ContainerKind::List {
                    return Err(mismatch());
                }
                if !position.is_valid() {
                    return Err(ApplyError::InvalidPosition { list: target, item: *item });
                }
                let idx = self
                    .find_item(target, *item)
                    .ok_or(ApplyError::UnknownItem { list: target, item: *item })?;
                if let Some(Body::List(items)) = self.body_mut(target) {
                    if stamp > items[idx].moved {
                        let mut entry = items.remove(idx);
                        entry.position = position.clone();
                        entry.moved = stamp;
                        insert_sorted(items, entry);
                    }
                }
                Ok(())
            }
            OpPayload::Delete { item } => {
                if kind != ContainerKind::List {
                    return Err(mismatch());
                }
                let idx = self
                    .find_item(target, *item)
                    .ok_or(ApplyError::UnknownItem { list: target, item: *item })?;
                let mut orphan = None;
                if let Some(Body::List(items)) = self.body_mut(target) {
                    let entry = &mut items[idx];
                    if entry.deleted.is_none() {
                        entry.deleted = Some(stamp);
                        if let Slot::Node(child) = entry.value {
                            orphan = Some(child);
                        }
                    }
                }
                if let Some(child) = orphan {
                    self.mark_deleted(child, stamp);
                }
                Ok(())
            }
        }
    }

    /// The operation payload that undoes `payload` when applied after it.
    ///
    /// Must be computed against the tree as it is before `payload` is applied.
    /// Restored containers get fresh ids from `ids`.
    pub fn inverse(
        &self,
        target: NodeId,
        payload: &OpPayload,
        ids: &mut IdGen,
    ) -> Result<(NodeId, OpPayload), ApplyError> {
        let node = self.nodes.get(&target).ok_or(ApplyError::UnknownNode(target))?;
        let inverse = match payload {
            OpPayload::Set { key, .. } | OpPayload::Remove { key } => {
                let current = match &node.body {
                    Body::Object(fields) | Body::Map(fields) => fields.get(key).and_then(|f| f.value.as_ref()),
                    Body::List(_) => {
                        return Err(ApplyError::KindMismatch {
                            id: target,
                            kind: ContainerKind::List,
                            op: payload.name(),
                        })
                    }
                };
                match current {
                    Some(slot) => OpPayload::Set { key: key.clone(), value: self.export_slot(slot, None, ids)? },
                    None => OpPayload::Remove { key: key.clone() },
                }
            }
            OpPayload::Insert { item, .. } => OpPayload::Delete { item: *item },
            OpPayload::Move { item, .. } => {
                let entry = self.item(target, *item)?;
                OpPayload::Move { item: *item, position: entry.position.clone() }
            }
            OpPayload::Delete { item } => {
                let entry = self.item(target, *item)?;
                let fresh = ids.next_id();
                OpPayload::Insert {
                    item: fresh,
                    position: entry.position.clone(),
                    value: self.export_slot(&entry.value, Some(fresh), ids)?,
                }
            }
        };
        Ok((target, inverse))
    }

    /// Copy a live subtree as a creation payload with new ids.
    pub fn export_fresh(&self, id: NodeId, new_id: Option<NodeId>, ids: &mut IdGen) -> Result<NodeInit, ApplyError> {
        let node = self.nodes.get(&id).ok_or(ApplyError::UnknownNode(id))?;
        let id = new_id.unwrap_or_else(|| ids.next_id());
        let body = match &node.body {
            Body::Object(fields) => InitBody::Object(self.export_fields(fields, ids)?),
            Body::Map(fields) => InitBody::Map(self.export_fields(fields, ids)?),
            Body::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter().filter(|i| i.deleted.is_none()) {
                    let item_id = ids.next_id();
                    out.push(InitItem {
                        id: item_id,
                        position: item.position.clone(),
                        value: self.export_slot(&item.value, Some(item_id), ids)?,
                    });
                }
                InitBody::List(out)
            }
        };
        Ok(NodeInit { id, body })
    }

    /// Drop tombstones whose deleting write is at or below `watermark`.
    ///
    /// Returns the number of nodes removed.
    pub fn compact(&mut self, watermark: u64) -> usize {
        let expired = |stamp: &Stamp| stamp.version <= watermark;

        let mut doomed: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.deleted.as_ref().is_some_and(expired))
            .map(|n| n.id)
            .collect();
        let mut removed = 0;
        while let Some(id) = doomed.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                doomed.extend(node.body.children());
                removed += 1;
            }
        }

        for node in self.nodes.values_mut() {
            match &mut node.body {
                Body::Object(fields) | Body::Map(fields) => {
                    fields.retain(|_, f| f.value.is_some() || !expired(&f.stamp));
                }
                Body::List(items) => items.retain(|i| !i.deleted.as_ref().is_some_and(expired)),
            }
        }
        removed
    }

    /// Immutable view of the live document.
    pub fn to_live(&self) -> LiveNode {
        self.live_node(NodeId::ROOT).unwrap_or(LiveNode::Object {
            id: NodeId::ROOT,
            fields: BTreeMap::new(),
        })
    }

    fn live_node(&self, id: NodeId) -> Option<LiveNode> {
        let node = self.nodes.get(&id).filter(|n| n.deleted.is_none())?;
        let live_fields = |fields: &BTreeMap<String, Field>| {
            fields
                .iter()
                .filter_map(|(k, f)| Some((k.clone(), self.live_value(f.value.as_ref()?)?)))
                .collect()
        };
        Some(match &node.body {
            Body::Object(fields) => LiveNode::Object { id, fields: live_fields(fields) },
            Body::Map(fields) => LiveNode::Map { id, entries: live_fields(fields) },
            Body::List(items) => LiveNode::List {
                id,
                items: items
                    .iter()
                    .filter(|i| i.deleted.is_none())
                    .filter_map(|i| Some(LiveItem { id: i.id, value: self.live_value(&i.value)? }))
                    .collect(),
            },
        })
    }

    fn live_value(&self, slot: &Slot) -> Option<LiveValue> {
        match slot {
            Slot::Scalar(v) => Some(LiveValue::Scalar(v.0.clone())),
            Slot::Node(id) => self.live_node(*id).map(LiveValue::Node),
        }
    }

    fn export_fields(
        &self,
        fields: &BTreeMap<String, Field>,
        ids: &mut IdGen,
    ) -> Result<Vec<(String, NewValue)>, ApplyError> {
        let mut out = Vec::with_capacity(fields.len());
        for (key, field) in fields {
            if let Some(slot) = &field.value {
                out.push((key.clone(), self.export_slot(slot, None, ids)?));
            }
        }
        Ok(out)
    }

    fn export_slot(&self, slot: &Slot, new_id: Option<NodeId>, ids: &mut IdGen) -> Result<NewValue, ApplyError> {
        Ok(match slot {
            Slot::Scalar(v) => NewValue::Scalar(v.clone()),
            Slot::Node(id) => NewValue::Node(self.export_fresh(*id, new_id, ids)?),
        })
    }

    fn body_mut(&mut self, id: NodeId) -> Option<&mut Body> {
        self.nodes.get_mut(&id).map(|n| &mut n.body)
    }

    fn find_item(&self, list: NodeId, item: NodeId) -> Option<usize> {
        match self.nodes.get(&list).map(|n| &n.body) {
            Some(Body::List(items)) => items.iter().position(|i| i.id == item),
            _ => None,
        }
    }

    fn item(&self, list: NodeId, item: NodeId) -> Result<&ListItem, ApplyError> {
        match self.nodes.get(&list).map(|n| &n.body) {
            Some(Body::List(items)) => items
                .iter()
                .find(|i| i.id == item)
                .ok_or(ApplyError::UnknownItem { list, item }),
            Some(body) => Err(ApplyError::KindMismatch { id: list, kind: body.kind(), op: "item lookup" }),
            None => Err(ApplyError::UnknownNode(list)),
        }
    }

    fn write_field(&mut self, target: NodeId, key: &str, value: Option<&NewValue>, stamp: Stamp) {
        let current = match self.nodes.get(&target).map(|n| &n.body) {
            Some(Body::Object(fields)) | Some(Body::Map(fields)) => fields.get(key).cloned(),
            _ => return,
        };
        let wins = current.as_ref().is_none_or(|f| stamp > f.stamp);

        let slot = value.map(|v| self.materialize_value(v, target, stamp));
        if !wins {
            // Keep the losing container around so later operations on it still resolve.
            if let Some(Slot::Node(id)) = slot {
                self.mark_deleted(id, stamp);
            }
            return;
        }
        if let Some(Field { value: Some(Slot::Node(old)), .. }) = current {
            self.mark_deleted(old, stamp);
        }
        if let Some(Body::Object(fields)) | Some(Body::Map(fields)) = self.body_mut(target) {
            fields.insert(key.to_string(), Field { value: slot, stamp });
        }
    }

    fn mark_deleted(&mut self, id: NodeId, stamp: Stamp) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.deleted.get_or_insert(stamp);
        }
    }

    fn validate_init(&self, init: &NodeInit, seen: &mut HashSet<NodeId>) -> Result<(), ApplyError> {
        if init.id.is_root() || self.nodes.contains_key(&init.id) || !seen.insert(init.id) {
            return Err(ApplyError::DuplicateNode(init.id));
        }
        match &init.body {
            InitBody::Object(fields) | InitBody::Map(fields) => {
                let mut keys = HashSet::new();
                for (key, value) in fields {
                    if !keys.insert(key.as_str()) {
                        return Err(ApplyError::MalformedInit(init.id));
                    }
                    if let NewValue::Node(child) = value {
                        self.validate_init(child, seen)?;
                    }
                }
            }
            InitBody::List(items) => {
                let mut item_ids = HashSet::new();
                for item in items {
                    if !item_ids.insert(item.id) {
                        return Err(ApplyError::DuplicateNode(item.id));
                    }
                    if !item.position.is_valid() {
                        return Err(ApplyError::InvalidPosition { list: init.id, item: item.id });
                    }
                    if let NewValue::Node(child) = &item.value {
                        if child.id != item.id {
                            return Err(ApplyError::MalformedInit(child.id));
                        }
                        self.validate_init(child, seen)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Insert a validated value, returning the slot that refers to it.
    fn materialize_value(&mut self, value: &NewValue, parent: NodeId, stamp: Stamp) -> Slot {
        match value {
            NewValue::Scalar(v) => Slot::Scalar(v.clone()),
            NewValue::Node(init) => {
                self.materialize(init, parent, stamp);
                Slot::Node(init.id)
            }
        }
    }

    fn materialize(&mut self, init: &NodeInit, parent: NodeId, stamp: Stamp) {
        let body = match &init.body {
            InitBody::Object(fields) | InitBody::Map(fields) => {
                let mut out = BTreeMap::new();
                for (key, value) in fields {
                    let slot = self.materialize_value(value, init.id, stamp);
                    out.insert(key.clone(), Field { value: Some(slot), stamp });
                }
                if matches!(init.body, InitBody::Object(_)) {
                    Body::Object(out)
                } else {
                    Body::Map(out)
                }
            }
            InitBody::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let slot = self.materialize_value(&item.value, init.id, stamp);
                    insert_sorted(
                        &mut out,
                        ListItem {
                            id: item.id,
                            position: item.position.clone(),
                            value: slot,
                            moved: stamp,
                            deleted: None,
                        },
                    );
                }
                Body::List(out)
            }
        };
        self.nodes.insert(
            init.id,
            Node { id: init.id, parent: Some(parent), body, deleted: None },
        );
    }
}

fn insert_sorted(items: &mut Vec<ListItem>, entry: ListItem) {
    let idx = items.partition_point(|i| (&i.position, i.id) < (&entry.position, entry.id));
    items.insert(idx, entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ActorId;
    use serde_json::json;

    fn actor(n: u128) -> ActorId {
        ActorId::from_u128(n)
    }

    fn op(actor_n: u128, seq: u64, target: NodeId, payload: OpPayload) -> Operation {
        Operation::new(actor(actor_n), seq, target, payload)
    }

    fn set_scalar(key: &str, v: serde_json::Value) -> OpPayload {
        OpPayload::Set { key: key.into(), value: NewValue::Scalar(Json(v)) }
    }

    fn new_list(id: NodeId) -> NewValue {
        NewValue::Node(NodeInit { id, body: InitBody::List(Vec::new()) })
    }

    #[test]
    fn test_set_is_last_writer_wins() {
        let mut tree = Tree::new();
        let first = op(1, 1, NodeId::ROOT, set_scalar("count", json!(1)));
        let second = op(2, 1, NodeId::ROOT, set_scalar("count", json!(2)));
        tree.apply(&second, Stamp::committed(5, &second)).unwrap();
        // An older write arriving late loses.
        tree.apply(&first, Stamp::committed(4, &first)).unwrap();
        assert_eq!(tree.to_live().to_json(), json!({"count": 2}));
    }

    #[test]
    fn test_remove_leaves_tombstone_until_compaction() {
        let mut tree = Tree::new();
        let set = op(1, 1, NodeId::ROOT, set_scalar("k", json!("v")));
        let rm = op(1, 2, NodeId::ROOT, OpPayload::Remove { key: "k".into() });
        tree.apply(&set, Stamp::committed(1, &set)).unwrap();
        tree.apply(&rm, Stamp::committed(2, &rm)).unwrap();
        assert_eq!(tree.to_live().to_json(), json!({}));

        let stale = op(2, 1, NodeId::ROOT, set_scalar("k", json!("old")));
        tree.apply(&stale, Stamp::committed(1, &stale)).unwrap();
        assert_eq!(tree.to_live().to_json(), json!({}));

        tree.compact(2);
        match &tree.node(NodeId::ROOT).unwrap().body {
            Body::Object(fields) => assert!(fields.is_empty()),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_inserts_at_same_spot_order_by_id() {
        let list = NodeId::new(actor(1), 1);
        let mut tree = Tree::new();
        let create = op(1, 1, NodeId::ROOT, OpPayload::Set { key: "l".into(), value: new_list(list) });
        tree.apply(&create, Stamp::committed(1, &create)).unwrap();

        let pos = Position::first();
        let a = NodeId::new(actor(2), 1);
        let b = NodeId::new(actor(3), 1);
        let ins = |who: u128, item: NodeId, v: i32| {
            op(who, 1, list, OpPayload::Insert { item, position: pos.clone(), value: NewValue::Scalar(Json(json!(v))) })
        };

        let mut one = tree.clone();
        let mut two = tree.clone();
        let (ia, ib) = (ins(2, a, 10), ins(3, b, 20));
        one.apply(&ia, Stamp::committed(2, &ia)).unwrap();
        one.apply(&ib, Stamp::committed(3, &ib)).unwrap();
        two.apply(&ib, Stamp::committed(3, &ib)).unwrap();
        two.apply(&ia, Stamp::committed(2, &ia)).unwrap();
        assert_eq!(one.to_live(), two.to_live());
        assert_eq!(one.to_live().to_json(), json!({"l": [10, 20]}));
    }

    #[test]
    fn test_delete_tombstones_and_move_still_resolves() {
        let list = NodeId::new(actor(1), 1);
        let item = NodeId::new(actor(1), 2);
        let mut tree = Tree::new();
        let create = op(1, 1, NodeId::ROOT, OpPayload::Set { key: "l".into(), value: new_list(list) });
        let ins = op(1, 2, list, OpPayload::Insert {
            item,
            position: Position::first(),
            value: NewValue::Scalar(Json(json!("x"))),
        });
        tree.apply(&create, Stamp::committed(1, &create)).unwrap();
        tree.apply(&ins, Stamp::committed(2, &ins)).unwrap();

        let del = op(2, 1, list, OpPayload::Delete { item });
        let mv = op(3, 1, list, OpPayload::Move { item, position: Position::after(&Position::first()) });
        tree.apply(&del, Stamp::committed(3, &del)).unwrap();
        tree.apply(&mv, Stamp::committed(4, &mv)).unwrap();
        assert_eq!(tree.to_live().to_json(), json!({"l": []}));

        tree.compact(3);
        assert!(tree.visible_items(list).is_empty());
        assert_eq!(
            tree.apply(&mv, Stamp::committed(5, &mv)),
            Err(ApplyError::UnknownItem { list, item })
        );
    }

    #[test]
    fn test_overwritten_container_is_compacted_with_descendants() {
        let outer = NodeId::new(actor(1), 1);
        let inner = NodeId::new(actor(1), 2);
        let mut tree = Tree::new();
        let create = op(1, 1, NodeId::ROOT, OpPayload::Set {
            key: "o".into(),
            value: NewValue::Node(NodeInit {
                id: outer,
                body: InitBody::Object(vec![(
                    "child".into(),
                    NewValue::Node(NodeInit { id: inner, body: InitBody::Map(Vec::new()) }),
                )]),
            }),
        });
        tree.apply(&create, Stamp::committed(1, &create)).unwrap();
        assert!(tree.is_live(inner));

        let overwrite = op(2, 1, NodeId::ROOT, set_scalar("o", json!(null)));
        tree.apply(&overwrite, Stamp::committed(2, &overwrite)).unwrap();
        assert!(!tree.is_live(inner));
        assert!(tree.contains(inner));

        assert_eq!(tree.compact(2), 2);
        assert!(!tree.contains(outer));
        assert!(!tree.contains(inner));
    }

    #[test]
    fn test_duplicate_node_is_rejected_without_side_effects() {
        let list = NodeId::new(actor(1), 1);
        let mut tree = Tree::new();
        let create = op(1, 1, NodeId::ROOT, OpPayload::Set { key: "l".into(), value: new_list(list) });
        tree.apply(&create, Stamp::committed(1, &create)).unwrap();
        let before = tree.clone();

        let again = op(1, 2, NodeId::ROOT, OpPayload::Set { key: "m".into(), value: new_list(list) });
        assert_eq!(tree.apply(&again, Stamp::committed(2, &again)), Err(ApplyError::DuplicateNode(list)));
        assert_eq!(tree, before);
    }

    #[test]
    fn test_invalid_positions_are_rejected() {
        let list = NodeId::new(actor(1), 1);
        let item = NodeId::new(actor(1), 2);
        let mut tree = Tree::new();
        let create = op(1, 1, NodeId::ROOT, OpPayload::Set { key: "l".into(), value: new_list(list) });
        tree.apply(&create, Stamp::committed(1, &create)).unwrap();
        let before = tree.clone();

        for bad in ["", "a!"] {
            let ins = op(2, 1, list, OpPayload::Insert {
                item,
                position: Position::unchecked(bad),
                value: NewValue::Scalar(Json(json!(1))),
            });
            assert_eq!(
                tree.apply(&ins, Stamp::committed(2, &ins)),
                Err(ApplyError::InvalidPosition { list, item })
            );
        }
        assert_eq!(tree, before);

        let ins = op(2, 1, list, OpPayload::Insert {
            item,
            position: Position::first(),
            value: NewValue::Scalar(Json(json!(1))),
        });
        tree.apply(&ins, Stamp::committed(2, &ins)).unwrap();
        let mv = op(2, 2, list, OpPayload::Move { item, position: Position::unchecked("") });
        assert_eq!(tree.apply(&mv, Stamp::committed(3, &mv)), Err(ApplyError::InvalidPosition { list, item }));

        // Items carried inside a new list container are checked too.
        let nested = NodeId::new(actor(3), 1);
        let child = NodeId::new(actor(3), 2);
        let set = op(3, 1, NodeId::ROOT, OpPayload::Set {
            key: "n".into(),
            value: NewValue::Node(NodeInit {
                id: nested,
                body: InitBody::List(vec![InitItem {
                    id: child,
                    position: Position::unchecked("b!"),
                    value: NewValue::Scalar(Json(json!(0))),
                }]),
            }),
        });
        assert_eq!(
            tree.apply(&set, Stamp::committed(4, &set)),
            Err(ApplyError::InvalidPosition { list: nested, item: child })
        );
        assert_eq!(tree.to_live().to_json(), json!({"l": [1]}));
    }

    #[test]
    fn test_kind_mismatch() {
        let mut tree = Tree::new();
        let bad = op(1, 1, NodeId::ROOT, OpPayload::Delete { item: NodeId::new(actor(1), 9) });
        assert!(matches!(
            tree.apply(&bad, Stamp::committed(1, &bad)),
            Err(ApplyError::KindMismatch { kind: ContainerKind::Object, .. })
        ));
        let missing = op(1, 2, NodeId::new(actor(4), 4), set_scalar("k", json!(1)));
        assert!(matches!(tree.apply(&missing, Stamp::committed(2, &missing)), Err(ApplyError::UnknownNode(_))));
    }

    #[test]
    fn test_inverse_of_delete_restores_copy() {
        let list = NodeId::new(actor(1), 1);
        let item = NodeId::new(actor(1), 2);
        let mut tree = Tree::new();
        let create = op(1, 1, NodeId::ROOT, OpPayload::Set { key: "l".into(), value: new_list(list) });
        let ins = op(1, 2, list, OpPayload::Insert {
            item,
            position: Position::first(),
            value: NewValue::Node(NodeInit {
                id: item,
                body: InitBody::Object(vec![("name".into(), NewValue::Scalar(Json(json!("a"))))]),
            }),
        });
        tree.apply(&create, Stamp::committed(1, &create)).unwrap();
        tree.apply(&ins, Stamp::committed(2, &ins)).unwrap();
        let before = tree.to_live().to_json();

        let mut ids = IdGen::new(actor(1));
        let _ = (ids.next_id(), ids.next_id());
        let del = op(1, 3, list, OpPayload::Delete { item });
        let (target, inverse) = tree.inverse(del.target, &del.payload, &mut ids).unwrap();
        tree.apply(&del, Stamp::committed(3, &del)).unwrap();
        let undo = op(1, 4, target, inverse);
        tree.apply(&undo, Stamp::committed(4, &undo)).unwrap();
        assert_eq!(tree.to_live().to_json(), before);
    }
}
