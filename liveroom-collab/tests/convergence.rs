//! Replicas converge on the authority's document under arbitrary
//! interleavings of edits, undo, delivery and dropped connections.
//!
//! Everything runs sans-IO: each connection is a pair of FIFO queues between
//! a `RoomState` and an `AuthorityRoom`.

use liveroom_collab::{AuthorityRoom, ClientConfig, ClientMessage, ConnectionEvent, RoomState, ServerMessage};
use liveroom_core::{ActorId, Input, LiveNode, NodeId};
use proptest::prelude::*;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Instant;

const CLIENTS: usize = 3;
const KEYS: [&str; 3] = ["a", "b", "c"];

struct Replica {
    state: RoomState,
    conn: Option<u64>,
    to_server: VecDeque<ClientMessage>,
    to_client: VecDeque<ServerMessage>,
}

struct Sim {
    authority: AuthorityRoom,
    replicas: Vec<Replica>,
    next_conn: u64,
    now: Instant,
}

#[derive(Debug, Clone)]
enum Action {
    Edit { client: usize, kind: u8, key: usize, value: i64 },
    Undo { client: usize },
    Redo { client: usize },
    ToServer { client: usize },
    ToClient { client: usize },
    Drop { client: usize, deliver_inflight: bool },
    Reconnect { client: usize },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    let client = 0..CLIENTS;
    prop_oneof![
        4 => (client.clone(), 0u8..6, 0..KEYS.len(), -5i64..5)
            .prop_map(|(client, kind, key, value)| Action::Edit { client, kind, key, value }),
        1 => client.clone().prop_map(|client| Action::Undo { client }),
        1 => client.clone().prop_map(|client| Action::Redo { client }),
        4 => client.clone().prop_map(|client| Action::ToServer { client }),
        4 => client.clone().prop_map(|client| Action::ToClient { client }),
        1 => (client.clone(), any::<bool>())
            .prop_map(|(client, deliver_inflight)| Action::Drop { client, deliver_inflight }),
        1 => client.prop_map(|client| Action::Reconnect { client }),
    ]
}

fn items_list(doc: &LiveNode) -> Option<NodeId> {
    doc.get("items").and_then(|v| v.as_node()).map(LiveNode::id)
}

impl Sim {
    fn new() -> Self {
        let replicas = (0..CLIENTS)
            .map(|i| Replica {
                state: RoomState::new("room", ActorId::from_u128(i as u128 + 1), ClientConfig::default()),
                conn: None,
                to_server: VecDeque::new(),
                to_client: VecDeque::new(),
            })
            .collect();
        let mut sim = Self { authority: AuthorityRoom::new("room", 100_000, 16), replicas, next_conn: 1, now: Instant::now() };
        for i in 0..CLIENTS {
            sim.replicas[i].state.transition(ConnectionEvent::Connect);
            sim.replicas[i].state.transition(ConnectionEvent::Authenticated);
            sim.join(i);
        }
        sim
    }

    fn join(&mut self, i: usize) {
        let conn = self.next_conn;
        self.next_conn += 1;
        let replica = &mut self.replicas[i];
        let hello = replica.state.hello("token".into(), self.now);
        let ClientMessage::Hello { actor, last_version, .. } = hello else {
            panic!("expected hello");
        };
        let greeting = self.authority.join(conn, actor, last_version).unwrap_or_else(|e| panic!("join failed: {e}"));
        replica.conn = Some(conn);
        replica.to_client.extend(greeting);
    }

    fn route(&mut self, outbound: Vec<liveroom_collab::Outbound>) {
        for out in outbound {
            for replica in &mut self.replicas {
                if let Some(conn) = replica.conn {
                    if let Some(msg) = out.for_peer(conn, replica.state.actor()) {
                        replica.to_client.push_back(msg);
                    }
                }
            }
        }
    }

    fn collect_outbox(&mut self, i: usize) {
        let replica = &mut self.replicas[i];
        let out = replica.state.take_outbox();
        if replica.conn.is_some() {
            replica.to_server.extend(out);
        }
    }

    fn to_server(&mut self, i: usize) -> bool {
        let Some(conn) = self.replicas[i].conn else { return false };
        let Some(msg) = self.replicas[i].to_server.pop_front() else { return false };
        let outbound = self.authority.handle(conn, msg);
        self.route(outbound);
        true
    }

    fn to_client(&mut self, i: usize) -> bool {
        let Some(msg) = self.replicas[i].to_client.pop_front() else { return false };
        self.replicas[i].state.handle_message(msg, self.now);
        self.collect_outbox(i);
        true
    }

    fn drop_connection(&mut self, i: usize, deliver_inflight: bool) {
        let Some(conn) = self.replicas[i].conn else { return };
        if deliver_inflight {
            while self.to_server(i) {}
        }
        let replica = &mut self.replicas[i];
        replica.conn = None;
        replica.to_server.clear();
        replica.to_client.clear();
        replica.state.transport_lost();
        let outbound = self.authority.leave(conn);
        self.route(outbound);
    }

    fn reconnect(&mut self, i: usize) {
        if self.replicas[i].conn.is_some() {
            return;
        }
        self.replicas[i].state.transition(ConnectionEvent::BackoffElapsed);
        self.join(i);
    }

    fn edit(&mut self, i: usize, kind: u8, key: usize, value: i64) {
        let key = KEYS[key];
        let state = &mut self.replicas[i].state;
        // Edits that no longer fit the local document are simply refused.
        let _ = state.mutate(|m| {
            let list = items_list(&m.snapshot());
            match (kind, list) {
                (0, _) => m.set(NodeId::ROOT, key, json!(value)).map(|_| ()),
                (1, _) => m.remove(NodeId::ROOT, key),
                (2, None) | (5, None) => m.set(NodeId::ROOT, "items", Input::List(Vec::new())).map(|_| ()),
                (2, Some(list)) => m.push(list, json!(value)).map(|_| ()),
                (3, Some(list)) => {
                    let len = m.list_len(list)?;
                    m.delete(list, value.unsigned_abs() as usize % len.max(1))
                }
                (4, Some(list)) => {
                    let len = m.list_len(list)?;
                    m.move_item(list, 0, value.unsigned_abs() as usize % len.max(1))
                }
                (5, Some(list)) => m.insert(list, 0, Input::object([("v", Input::scalar(value))])).map(|_| ()),
                _ => Ok(()),
            }
        });
        self.collect_outbox(i);
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Edit { client, kind, key, value } => self.edit(client, kind, key, value),
            Action::Undo { client } => {
                let _ = self.replicas[client].state.undo();
                self.collect_outbox(client);
            }
            Action::Redo { client } => {
                let _ = self.replicas[client].state.redo();
                self.collect_outbox(client);
            }
            Action::ToServer { client } => {
                self.to_server(client);
            }
            Action::ToClient { client } => {
                self.to_client(client);
            }
            Action::Drop { client, deliver_inflight } => self.drop_connection(client, deliver_inflight),
            Action::Reconnect { client } => self.reconnect(client),
        }
    }

    fn settle(&mut self) {
        for i in 0..CLIENTS {
            self.reconnect(i);
        }
        loop {
            let mut progressed = false;
            for i in 0..CLIENTS {
                progressed |= self.to_server(i);
                progressed |= self.to_client(i);
            }
            if !progressed {
                break;
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn replicas_converge(actions in proptest::collection::vec(action_strategy(), 0..120)) {
        let mut sim = Sim::new();
        for action in actions {
            sim.apply(action);
        }
        sim.settle();

        let expected = sim.authority.tree().to_live().to_json();
        for replica in &sim.replicas {
            prop_assert!(replica.state.pending().is_empty(), "unsettled operations on {}", replica.state.actor());
            prop_assert_eq!(replica.state.version(), sim.authority.version());
            prop_assert_eq!(replica.state.snapshot().to_json(), expected.clone());
        }
    }
}

#[test]
fn offline_edits_commit_once_after_reconnect() {
    let mut sim = Sim::new();
    sim.settle();
    sim.drop_connection(0, false);
    for value in 0..3 {
        sim.edit(0, 0, 0, value);
    }
    sim.edit(1, 0, 1, 9);
    sim.settle();

    // Three offline edits and one online edit.
    assert_eq!(sim.authority.version(), 4);
    let expected = json!({"a": 2, "b": 9});
    for replica in &sim.replicas {
        assert_eq!(replica.state.snapshot().to_json(), expected);
    }
}

#[test]
fn retransmission_after_lost_acks_is_not_duplicated() {
    let mut sim = Sim::new();
    sim.settle();
    sim.edit(0, 2, 0, 0);
    sim.settle();
    sim.edit(0, 2, 0, 7);
    // The push reaches the authority, but the ack is lost with the connection.
    sim.drop_connection(0, true);
    sim.settle();

    assert_eq!(sim.authority.version(), 2);
    for replica in &sim.replicas {
        assert_eq!(replica.state.snapshot().to_json(), json!({"items": [7]}));
        assert!(replica.state.pending().is_empty());
    }
}
