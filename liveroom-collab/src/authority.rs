//! Reference authority: orders operations and fans them out.
//!
//! ```text
//! Client A ──┐                          ┌──► Client A  (own op → Ack)
//!             ├── AuthorityRoom ── BroadcastGroup ──┤
//! Client B ──┘   tree, version,         └──► Client B  (Op { version })
//!                replay history, ledger
//! ```
//!
//! [`AuthorityRoom`] is the per-room state machine and does no IO.
//! [`AuthorityServer`] accepts WebSocket connections and drives one room
//! state per room name. Everything is kept in memory.

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::config::AuthorityConfig;
use crate::protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use liveroom_core::{ActorId, Json, Operation, Stamp, Tree};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

/// Connection id, unique per server.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    All,
    Only(ConnId),
    AllExcept(ConnId),
}

/// A message addressed to some of the connections in a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub recipient: Recipient,
    pub message: ServerMessage,
}

impl Outbound {
    pub fn all(message: ServerMessage) -> Self {
        Self { recipient: Recipient::All, message }
    }

    pub fn only(conn: ConnId, message: ServerMessage) -> Self {
        Self { recipient: Recipient::Only(conn), message }
    }

    /// What connection `conn` of `actor` should receive, if anything. A
    /// peer's own committed operation reaches it as an `Ack`.
    pub fn for_peer(&self, conn: ConnId, actor: ActorId) -> Option<ServerMessage> {
        let addressed = match self.recipient {
            Recipient::All => true,
            Recipient::Only(c) => c == conn,
            Recipient::AllExcept(c) => c != conn,
        };
        if !addressed {
            return None;
        }
        match &self.message {
            ServerMessage::Op { version, op } if op.actor == actor => {
                Some(ServerMessage::Ack { local_seq: op.local_seq, version: *version })
            }
            message => Some(message.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("room is full")]
    RoomFull,
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Committed(u64),
    Rejected(String),
}

#[derive(Debug, Default)]
struct Ledger {
    /// Highest sequence processed.
    last_seq: u64,
    /// Recent outcomes, answered again when a sequence is retransmitted.
    outcomes: BTreeMap<u64, Outcome>,
}

impl Ledger {
    fn rejected(&self) -> Vec<(u64, String)> {
        self.outcomes
            .iter()
            .filter_map(|(seq, outcome)| match outcome {
                Outcome::Rejected(reason) => Some((*seq, reason.clone())),
                Outcome::Committed(_) => None,
            })
            .collect()
    }
}

#[derive(Debug)]
struct Peer {
    actor: ActorId,
    reported_version: u64,
}

/// Authoritative state of one room.
#[derive(Debug)]
pub struct AuthorityRoom {
    name: String,
    tree: Tree,
    version: u64,
    history: VecDeque<(u64, Operation)>,
    history_limit: usize,
    max_peers: usize,
    ledger: HashMap<ActorId, Ledger>,
    presence: HashMap<ActorId, Json>,
    peers: HashMap<ConnId, Peer>,
    compacted_through: u64,
}

impl AuthorityRoom {
    pub fn new(name: impl Into<String>, history_limit: usize, max_peers: usize) -> Self {
        Self {
            name: name.into(),
            tree: Tree::new(),
            version: 0,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            max_peers,
            ledger: HashMap::new(),
            presence: HashMap::new(),
            peers: HashMap::new(),
            compacted_through: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Register a connection. Returns what it must receive before anything
    /// broadcast afterwards: `Welcome`, the catch-up, then other peers'
    /// presence.
    pub fn join(&mut self, conn: ConnId, actor: ActorId, last_version: u64) -> Result<Vec<ServerMessage>, JoinError> {
        if self.peers.len() >= self.max_peers {
            return Err(JoinError::RoomFull);
        }
        self.peers.insert(conn, Peer { actor, reported_version: last_version.min(self.version) });

        let mut out = vec![ServerMessage::Welcome { version: self.version }];
        out.extend(self.catch_up(actor, last_version));
        out.extend(
            self.presence
                .iter()
                .filter(|(other, _)| **other != actor)
                .map(|(other, data)| ServerMessage::Presence { actor: *other, data: data.clone() }),
        );
        log::info!("room {}: {actor} joined at version {last_version} (room at {})", self.name, self.version);
        Ok(out)
    }

    fn catch_up(&self, actor: ActorId, last_version: u64) -> Vec<ServerMessage> {
        if last_version == self.version {
            return Vec::new();
        }
        let oldest = self.history.front().map_or(self.version + 1, |(v, _)| *v);
        // Below the watermark the replica missed a `Compact` and still holds
        // tombstones everyone else dropped.
        let replayable = last_version >= self.compacted_through && last_version + 1 >= oldest;
        if last_version < self.version && replayable {
            return self
                .history
                .iter()
                .filter(|(v, _)| *v > last_version)
                .map(|(version, op)| ServerMessage::Op { version: *version, op: op.clone() })
                .collect();
        }
        vec![self.snapshot(actor)]
    }

    fn snapshot(&self, actor: ActorId) -> ServerMessage {
        let (acked_through, rejected) = match self.ledger.get(&actor) {
            Some(ledger) => (ledger.last_seq, ledger.rejected()),
            None => (0, Vec::new()),
        };
        ServerMessage::Snapshot { version: self.version, tree: self.tree.clone(), acked_through, rejected }
    }

    pub fn handle(&mut self, conn: ConnId, msg: ClientMessage) -> Vec<Outbound> {
        let Some(actor) = self.peers.get(&conn).map(|p| p.actor) else {
            return vec![Outbound::only(
                conn,
                ServerMessage::Error { code: ErrorCode::Malformed, message: "not joined".into() },
            )];
        };
        match msg {
            ClientMessage::Op(op) => self.commit(conn, actor, op),
            ClientMessage::Presence { data } => {
                self.presence.insert(actor, data.clone());
                vec![Outbound { recipient: Recipient::AllExcept(conn), message: ServerMessage::Presence { actor, data } }]
            }
            ClientMessage::FetchSnapshot => {
                log::info!("room {}: snapshot requested by {actor}", self.name);
                vec![Outbound::only(conn, self.snapshot(actor))]
            }
            ClientMessage::Ping { version } => {
                if let Some(peer) = self.peers.get_mut(&conn) {
                    peer.reported_version = version.min(self.version);
                }
                let mut out = vec![Outbound::only(conn, ServerMessage::Pong)];
                out.extend(self.compact());
                out
            }
            ClientMessage::Hello { .. } => vec![Outbound::only(
                conn,
                ServerMessage::Error { code: ErrorCode::Malformed, message: "already joined".into() },
            )],
        }
    }

    fn commit(&mut self, conn: ConnId, actor: ActorId, op: Operation) -> Vec<Outbound> {
        let seq = op.local_seq;
        if op.actor != actor {
            return vec![reject(conn, seq, "operation signed by another actor")];
        }

        let ledger = self.ledger.entry(actor).or_default();
        if seq <= ledger.last_seq {
            // Retransmission after a reconnect.
            let outcome = ledger.outcomes.get(&seq).cloned();
            log::debug!("room {}: {actor}#{seq} seen before", self.name);
            return match outcome {
                Some(Outcome::Committed(version)) => {
                    vec![Outbound::only(conn, ServerMessage::Ack { local_seq: seq, version })]
                }
                Some(Outcome::Rejected(reason)) => vec![reject(conn, seq, &reason)],
                // Too old to remember: the snapshot settles it.
                None => vec![Outbound::only(conn, self.snapshot(actor))],
            };
        }
        ledger.last_seq = seq;

        let version = self.version + 1;
        let outcome = match self.tree.apply(&op, Stamp::committed(version, &op)) {
            Ok(()) => Outcome::Committed(version),
            Err(e) => {
                log::warn!("room {}: rejected {actor}#{seq}: {e}", self.name);
                Outcome::Rejected(e.to_string())
            }
        };
        self.remember(actor, seq, outcome.clone());
        if let Outcome::Rejected(reason) = outcome {
            return vec![reject(conn, seq, &reason)];
        }

        self.version = version;
        self.history.push_back((version, op.clone()));
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        log::debug!("room {}: committed {actor}#{seq} at version {version}", self.name);
        vec![Outbound::all(ServerMessage::Op { version, op })]
    }

    fn remember(&mut self, actor: ActorId, seq: u64, outcome: Outcome) {
        let ledger = self.ledger.entry(actor).or_default();
        ledger.outcomes.insert(seq, outcome);
        while ledger.outcomes.len() > self.history_limit {
            ledger.outcomes.pop_first();
        }
    }

    /// Let every replica drop tombstones older than the lowest version any
    /// connected peer reported.
    fn compact(&mut self) -> Option<Outbound> {
        let watermark = self.peers.values().map(|p| p.reported_version).min()?;
        if watermark <= self.compacted_through {
            return None;
        }
        let removed = self.tree.compact(watermark);
        self.compacted_through = watermark;
        log::debug!("room {}: compacted through {watermark} ({removed} nodes)", self.name);
        Some(Outbound::all(ServerMessage::Compact { version: watermark }))
    }

    /// Forget a connection. Announces the actor's departure once its last
    /// connection is gone.
    pub fn leave(&mut self, conn: ConnId) -> Vec<Outbound> {
        let Some(peer) = self.peers.remove(&conn) else {
            return Vec::new();
        };
        if self.peers.values().any(|p| p.actor == peer.actor) {
            return Vec::new();
        }
        self.presence.remove(&peer.actor);
        log::info!("room {}: {} left", self.name, peer.actor);
        vec![Outbound { recipient: Recipient::AllExcept(conn), message: ServerMessage::PeerLeft { actor: peer.actor } }]
    }
}

fn reject(conn: ConnId, local_seq: u64, reason: &str) -> Outbound {
    Outbound::only(conn, ServerMessage::Reject { local_seq, reason: reason.to_string() })
}

/// Decides whether a token may enter a room.
pub type TokenValidator = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_handshakes: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_handshakes: AtomicU64,
}

struct RoomEntry {
    state: Mutex<AuthorityRoom>,
    broadcast: BroadcastGroup<Arc<Outbound>>,
}

impl RoomEntry {
    fn lock(&self) -> std::sync::MutexGuard<'_, AuthorityRoom> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, outbound: Vec<Outbound>) {
        for out in outbound {
            self.broadcast.send(Arc::new(out));
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct AuthorityServer {
    config: AuthorityConfig,
    rooms: RoomManager<RoomEntry>,
    validator: TokenValidator,
    next_conn: AtomicU64,
    stats: AtomicServerStats,
}

impl AuthorityServer {
    /// A server that accepts every token.
    pub fn new(config: AuthorityConfig) -> Self {
        Self::with_validator(config, Arc::new(|_: &str, _: &str| true))
    }

    pub fn with_validator(config: AuthorityConfig, validator: TokenValidator) -> Self {
        Self {
            config,
            rooms: RoomManager::new(),
            validator,
            next_conn: AtomicU64::new(1),
            stats: AtomicServerStats::default(),
        }
    }

    /// Accept only the given tokens.
    pub fn with_tokens(config: AuthorityConfig, tokens: Vec<String>) -> Self {
        Self::with_validator(config, Arc::new(move |_room: &str, token: &str| tokens.iter().any(|t| t == token)))
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    /// Current version of a room, if it exists.
    pub async fn room_version(&self, name: &str) -> Option<u64> {
        let entry = self.rooms.get(name).await?;
        let version = entry.lock().version();
        Some(version)
    }

    pub fn stats(&self) -> ServerStats {
        let s = &self.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            rejected_handshakes: s.rejected_handshakes.load(Ordering::Relaxed),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("authority listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let idle = self.config.idle_timeout();
        let hello = match tokio::time::timeout(idle, self.next_message(&mut ws_receiver)).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ProtocolError::Timeout.into()),
        };
        let (room, actor, token, last_version) = match hello {
            ClientMessage::Hello { room, actor, token, last_version } => (room, actor, token, last_version),
            other => {
                let refusal = ServerMessage::Error { code: ErrorCode::Malformed, message: "expected hello".into() };
                ws_sender.send(Message::Binary(refusal.encode()?.into())).await?;
                return Err(ProtocolError::UnexpectedFrame(other.name()).into());
            }
        };

        if !(self.validator)(&room, &token) {
            log::info!("{addr}: token rejected for room {room}");
            self.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            let refusal = ServerMessage::Error { code: ErrorCode::AuthRejected, message: "invalid token".into() };
            ws_sender.send(Message::Binary(refusal.encode()?.into())).await?;
            let _ = ws_sender.close().await;
            return Ok(());
        }

        let config = &self.config;
        // Joining inside the registry lock keeps an emptied room from being
        // dropped between lookup and join. Subscribing under the room lock
        // means nothing committed after the catch-up is missed or doubled.
        let (entry, joined) = self
            .rooms
            .enter(
                &room,
                || RoomEntry {
                    state: Mutex::new(AuthorityRoom::new(room.clone(), config.history_limit, config.max_peers_per_room)),
                    broadcast: BroadcastGroup::new(config.broadcast_capacity),
                },
                |entry| {
                    let mut state = entry.lock();
                    state.join(conn, actor, last_version).map(|greeting| (greeting, entry.broadcast.subscribe()))
                },
            )
            .await;
        let (greeting, mut rx) = match joined {
            Ok(joined) => joined,
            Err(JoinError::RoomFull) => {
                log::warn!("{addr}: room {room} is full");
                let refusal = ServerMessage::Error { code: ErrorCode::RoomFull, message: room.clone() };
                ws_sender.send(Message::Binary(refusal.encode()?.into())).await?;
                self.rooms.remove_if(&room, |e| e.lock().is_empty()).await;
                return Ok(());
            }
        };
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let result = async {
            for msg in greeting {
                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
            }

            loop {
                tokio::select! {
                    frame = tokio::time::timeout(idle, ws_receiver.next()) => {
                        let Ok(frame) = frame else {
                            log::info!("{addr}: idle for {idle:?}, closing");
                            break;
                        };
                        match frame {
                            Some(Ok(Message::Binary(data))) => {
                                self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                                self.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                                match ClientMessage::decode(&data) {
                                    Ok(msg) => {
                                        let outbound = entry.lock().handle(conn, msg);
                                        entry.publish(outbound);
                                    }
                                    Err(e) => log::warn!("{addr}: undecodable frame: {e}"),
                                }
                            }
                            Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("{addr}: connection closed");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("{addr}: websocket error: {e}");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }

                    out = rx.recv() => match out {
                        Ok(out) => {
                            if let Some(msg) = out.for_peer(conn, actor) {
                                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // The client catches up from its last version on reconnect.
                            log::warn!("{addr}: lagged by {n} messages, closing");
                            entry.broadcast.record_dropped(n);
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        let outbound = entry.lock().leave(conn);
        entry.publish(outbound);
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        if self.rooms.remove_if(&room, |e| e.lock().is_empty()).await {
            log::info!("room {room} removed (empty)");
        }
        let _ = ws_sender.close().await;
        result
    }

    async fn next_message<S>(&self, receiver: &mut S) -> Result<Option<ClientMessage>, ProtocolError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Binary(data)) => return ClientMessage::decode(&data).map(Some),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(_) => return Err(ProtocolError::ConnectionClosed),
            }
        }
        Ok(None)
    }
}
