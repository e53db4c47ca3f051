//! Values stored in the document and the snapshots handed to consumers.

use crate::ids::NodeId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A JSON scalar or blob stored in a container field.
///
/// Serialized as JSON text so that compact, non-self-describing codecs can
/// carry it inside a frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Json(pub Value);

impl Json {
    pub fn null() -> Self {
        Self(Value::Null)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Json {
    fn from(v: Value) -> Self {
        Self(v)
    }
}

impl fmt::Display for Json {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Json {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for Json {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text)
            .map(Json)
            .map_err(serde::de::Error::custom)
    }
}

/// A value supplied by a caller when writing into the document.
///
/// Nested containers are created together with the field or list item that
/// holds them.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Scalar(Value),
    Object(Vec<(String, Input)>),
    Map(Vec<(String, Input)>),
    List(Vec<Input>),
}

impl Input {
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Input)>) -> Self {
        Input::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Input)>) -> Self {
        Input::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn list(items: impl IntoIterator<Item = Input>) -> Self {
        Input::List(items.into_iter().collect())
    }

    pub fn scalar(v: impl Into<Value>) -> Self {
        Input::Scalar(v.into())
    }
}

/// JSON objects become Object containers and arrays become Lists.
/// Use [`Input::Scalar`] directly to store a JSON blob as one opaque value.
impl From<Value> for Input {
    fn from(v: Value) -> Self {
        match v {
            Value::Object(map) => Input::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
            Value::Array(items) => Input::List(items.into_iter().map(Input::from).collect()),
            scalar => Input::Scalar(scalar),
        }
    }
}

/// Immutable snapshot of one container, as seen by consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveNode {
    Object {
        id: NodeId,
        fields: BTreeMap<String, LiveValue>,
    },
    Map {
        id: NodeId,
        entries: BTreeMap<String, LiveValue>,
    },
    List {
        id: NodeId,
        items: Vec<LiveItem>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveItem {
    pub id: NodeId,
    pub value: LiveValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveValue {
    Scalar(Value),
    Node(LiveNode),
}

impl LiveNode {
    pub fn id(&self) -> NodeId {
        match self {
            LiveNode::Object { id, .. } | LiveNode::Map { id, .. } | LiveNode::List { id, .. } => *id,
        }
    }

    /// Field of an Object or entry of a Map.
    pub fn get(&self, key: &str) -> Option<&LiveValue> {
        match self {
            LiveNode::Object { fields, .. } => fields.get(key),
            LiveNode::Map { entries, .. } => entries.get(key),
            LiveNode::List { .. } => None,
        }
    }

    /// Item of a List by visible index.
    pub fn item(&self, index: usize) -> Option<&LiveValue> {
        match self {
            LiveNode::List { items, .. } => items.get(index).map(|i| &i.value),
            _ => None,
        }
    }

    /// Number of fields, entries or items.
    pub fn len(&self) -> usize {
        match self {
            LiveNode::Object { fields, .. } => fields.len(),
            LiveNode::Map { entries, .. } => entries.len(),
            LiveNode::List { items, .. } => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Value {
        match self {
            LiveNode::Object { fields: kv, .. } | LiveNode::Map { entries: kv, .. } => {
                Value::Object(kv.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
            LiveNode::List { items, .. } => Value::Array(items.iter().map(|i| i.value.to_json()).collect()),
        }
    }
}

impl LiveValue {
    pub fn as_node(&self) -> Option<&LiveNode> {
        match self {
            LiveValue::Node(n) => Some(n),
            LiveValue::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            LiveValue::Scalar(v) => Some(v),
            LiveValue::Node(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            LiveValue::Scalar(v) => v.clone(),
            LiveValue::Node(n) => n.to_json(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_survives_binary_codec() {
        let v = Json(json!({"cursor": {"x": 1.5, "y": -2}, "tags": ["a", null]}));
        let bytes = bincode::serde::encode_to_vec(&v, bincode::config::standard()).unwrap();
        let (back, _): (Json, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_input_from_json_builds_containers() {
        let input = Input::from(json!({"title": "x", "items": [1, 2]}));
        match input {
            Input::Object(fields) => {
                assert_eq!(fields.len(), 2);
                assert!(fields.iter().any(|(k, v)| k == "items" && matches!(v, Input::List(l) if l.len() == 2)));
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_live_node_to_json() {
        let node = LiveNode::Object {
            id: NodeId::ROOT,
            fields: BTreeMap::from([("count".to_string(), LiveValue::Scalar(json!(1)))]),
        };
        assert_eq!(node.to_json(), json!({"count": 1}));
        assert_eq!(node.get("count").and_then(LiveValue::as_scalar), Some(&json!(1)));
        assert!(node.item(0).is_none());
    }
}
