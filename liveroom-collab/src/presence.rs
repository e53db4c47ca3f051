//! Ephemeral per-actor presence.
//!
//! ```text
//! set_local(patch) ──► merge into own entry, mark dirty
//!                           │ (throttled, coalesced)
//!                           ▼
//!                     flush() ──► ClientMessage::Presence (full state)
//!
//! ServerMessage::Presence ──► apply_remote(): replace the actor's entry
//! no update within timeout ──► expire(): synthetic Left
//! ```
//!
//! Nothing here is persisted or conflict-resolved: each actor is the only
//! writer of its own entry.

use liveroom_core::{ActorId, Json};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Entered { actor: ActorId, data: Value },
    Updated { actor: ActorId, data: Value },
    Left { actor: ActorId },
}

/// Read-only presence snapshot handed to consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceView {
    pub me: Map<String, Value>,
    pub others: BTreeMap<ActorId, Value>,
}

#[derive(Debug, Clone)]
struct RemotePeer {
    data: Value,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct PresenceState {
    actor: ActorId,
    local: Map<String, Value>,
    dirty: bool,
    last_sent: Option<Instant>,
    throttle: Duration,
    keepalive: Duration,
    timeout: Duration,
    peers: HashMap<ActorId, RemotePeer>,
}

impl PresenceState {
    pub fn new(actor: ActorId, throttle: Duration, keepalive: Duration, timeout: Duration) -> Self {
        Self {
            actor,
            local: Map::new(),
            dirty: false,
            last_sent: None,
            throttle,
            keepalive,
            timeout,
            peers: HashMap::new(),
        }
    }

    pub fn from_config(actor: ActorId, config: &crate::config::ClientConfig) -> Self {
        Self::new(actor, config.presence_throttle(), config.presence_keepalive(), config.presence_timeout())
    }

    /// Shallow-merge `patch` into our own entry.
    pub fn set_local(&mut self, patch: Map<String, Value>) {
        if patch.is_empty() {
            return;
        }
        for (key, value) in patch {
            self.local.insert(key, value);
        }
        self.dirty = true;
    }

    pub fn local(&self) -> &Map<String, Value> {
        &self.local
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Send our full state on the next flush, without waiting for the
    /// throttle. Used after (re)connecting.
    pub fn resend(&mut self) {
        if !self.local.is_empty() {
            self.dirty = true;
            self.last_sent = None;
        }
    }

    /// When the next update or keepalive should go out.
    pub fn flush_deadline(&self) -> Option<Instant> {
        if self.local.is_empty() {
            return None;
        }
        let wait = if self.dirty { self.throttle } else { self.keepalive };
        Some(self.last_sent.map_or_else(Instant::now, |sent| sent + wait))
    }

    /// Our full state if an update or keepalive is due at `now`.
    pub fn flush(&mut self, now: Instant) -> Option<Json> {
        let due = self.flush_deadline()?;
        if self.last_sent.is_some() && due > now {
            return None;
        }
        self.dirty = false;
        self.last_sent = Some(now);
        Some(Json(Value::Object(self.local.clone())))
    }

    /// Replace a peer's entry wholesale.
    pub fn apply_remote(&mut self, actor: ActorId, data: Value, now: Instant) -> Option<PresenceEvent> {
        if actor == self.actor {
            return None;
        }
        let previous = self.peers.insert(actor, RemotePeer { data: data.clone(), last_seen: now });
        match previous {
            None => {
                log::debug!("presence: {actor} entered");
                Some(PresenceEvent::Entered { actor, data })
            }
            Some(_) => Some(PresenceEvent::Updated { actor, data }),
        }
    }

    pub fn remove(&mut self, actor: ActorId) -> Option<PresenceEvent> {
        self.peers.remove(&actor).map(|_| {
            log::debug!("presence: {actor} left");
            PresenceEvent::Left { actor }
        })
    }

    /// Evict peers not heard from within the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<PresenceEvent> {
        let timeout = self.timeout;
        let stale: Vec<ActorId> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) >= timeout)
            .map(|(actor, _)| *actor)
            .collect();
        stale
            .into_iter()
            .filter_map(|actor| {
                log::info!("presence: {actor} timed out");
                self.peers.remove(&actor).map(|_| PresenceEvent::Left { actor })
            })
            .collect()
    }

    /// When the quietest peer times out.
    pub fn expiry_deadline(&self) -> Option<Instant> {
        self.peers.values().map(|peer| peer.last_seen + self.timeout).min()
    }

    /// Forget every peer, reporting each as gone.
    pub fn clear_peers(&mut self) -> Vec<PresenceEvent> {
        self.peers.drain().map(|(actor, _)| PresenceEvent::Left { actor }).collect()
    }

    pub fn peer(&self, actor: ActorId) -> Option<&Value> {
        self.peers.get(&actor).map(|peer| &peer.data)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn view(&self) -> PresenceView {
        PresenceView {
            me: self.local.clone(),
            others: self.peers.iter().map(|(actor, peer)| (*actor, peer.data.clone())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> PresenceState {
        PresenceState::new(
            ActorId::from_u128(1),
            Duration::from_millis(100),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
    }

    fn patch(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_shallow_merge() {
        let mut p = state();
        p.set_local(patch(json!({"cursor": {"x": 1}, "name": "ann"})));
        p.set_local(patch(json!({"cursor": {"y": 2}})));
        assert_eq!(Value::Object(p.local().clone()), json!({"cursor": {"y": 2}, "name": "ann"}));
    }

    #[test]
    fn test_rapid_updates_coalesce() {
        let mut p = state();
        let t0 = Instant::now();
        p.set_local(patch(json!({"x": 1})));
        assert_eq!(p.flush(t0).map(|j| j.0), Some(json!({"x": 1})));

        p.set_local(patch(json!({"x": 2})));
        p.set_local(patch(json!({"x": 3})));
        assert!(p.flush(t0 + Duration::from_millis(50)).is_none());
        assert_eq!(p.flush(t0 + Duration::from_millis(100)).map(|j| j.0), Some(json!({"x": 3})));
        assert!(p.flush(t0 + Duration::from_millis(200)).is_none());
    }

    #[test]
    fn test_keepalive() {
        let mut p = state();
        let t0 = Instant::now();
        assert!(p.flush(t0).is_none());
        p.set_local(patch(json!({"x": 1})));
        p.flush(t0);
        assert!(p.flush(t0 + Duration::from_secs(9)).is_none());
        assert!(p.flush(t0 + Duration::from_secs(10)).is_some());
        assert_eq!(p.flush_deadline(), Some(t0 + Duration::from_secs(20)));
    }

    #[test]
    fn test_remote_entries_replace_and_ignore_self() {
        let mut p = state();
        let now = Instant::now();
        let bob = ActorId::from_u128(2);
        assert!(p.apply_remote(ActorId::from_u128(1), json!({}), now).is_none());
        assert!(matches!(p.apply_remote(bob, json!({"a": 1, "b": 2}), now), Some(PresenceEvent::Entered { .. })));
        assert!(matches!(p.apply_remote(bob, json!({"a": 5}), now), Some(PresenceEvent::Updated { .. })));
        assert_eq!(p.peer(bob), Some(&json!({"a": 5})));
        assert_eq!(p.remove(bob), Some(PresenceEvent::Left { actor: bob }));
        assert_eq!(p.remove(bob), None);
    }

    #[test]
    fn test_silent_peers_expire() {
        let mut p = state();
        let t0 = Instant::now();
        let bob = ActorId::from_u128(2);
        let eve = ActorId::from_u128(3);
        p.apply_remote(bob, json!({}), t0);
        p.apply_remote(eve, json!({}), t0 + Duration::from_secs(20));
        assert_eq!(p.expiry_deadline(), Some(t0 + Duration::from_secs(30)));

        let left = p.expire(t0 + Duration::from_secs(30));
        assert_eq!(left, vec![PresenceEvent::Left { actor: bob }]);
        assert_eq!(p.peer_count(), 1);
        assert_eq!(p.view().others.keys().copied().collect::<Vec<_>>(), vec![eve]);
    }
}
