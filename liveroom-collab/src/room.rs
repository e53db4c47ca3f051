//! A collaborative room: one document, one presence map, one connection and
//! one operation log.
//!
//! ```text
//!   consumer ── mutate / undo / set_presence ──┐
//!                                              ▼
//!                        ┌──────────── RoomState (sans-IO) ───────────┐
//!   ServerMessage ─────► │ Document · OpLog · PresenceState · machine │ ──► outbox
//!   timers (tick) ─────► └──────────────────────┬─────────────────────┘
//!                                               ▼ take_changes()
//!                           Store<LiveNode> · Store<PresenceView> · events
//! ```
//!
//! [`RoomState`] holds every rule and does no IO; [`Room`] wraps it in a
//! mutex and runs a driver task that owns the WebSocket. Consumer calls are
//! applied synchronously under the mutex, then the driver is woken to send
//! whatever they produced.

use crate::config::ClientConfig;
use crate::connection::{AuthError, AuthProvider, Backoff, ConnectionEvent, ConnectionMachine, ConnectionStatus};
use crate::oplog::{Arrival, OpLog, OpLogError};
use crate::presence::{PresenceEvent, PresenceState, PresenceView};
use crate::protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use liveroom_core::{
    ActorId, Document, DocumentError, ErrorKind, Frame, Input, LiveNode, NewValue, NodeId, OpPayload, Operation, Store,
    StoreHandle, Tree,
};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Log(#[from] OpLogError),
    #[error("operation {local_seq} rejected by the authority: {reason}")]
    Rejected { local_seq: u64, reason: String },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("authority error ({code:?}): {message}")]
    Authority { code: ErrorCode, message: String },
}

impl RoomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoomError::Document(e) => e.kind(),
            RoomError::Log(e) => e.kind(),
            RoomError::Rejected { .. } => ErrorKind::MutationRejected,
            RoomError::Auth(e) => e.kind(),
            RoomError::Protocol(e) => e.kind(),
            RoomError::Authority { code, .. } => code.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Status(ConnectionStatus),
    Presence(PresenceEvent),
    Error(RoomError),
    /// The document was replaced by an authoritative snapshot.
    Resynced { version: u64 },
    History { can_undo: bool, can_redo: bool },
}

/// Everything that changed since the last [`RoomState::take_changes`].
#[derive(Debug, Default)]
pub struct Changes {
    pub revision: u64,
    pub document: Option<LiveNode>,
    pub presence: Option<PresenceView>,
    pub status: Option<ConnectionStatus>,
    pub events: Vec<RoomEvent>,
}

/// Sans-IO room.
pub struct RoomState {
    room: String,
    config: ClientConfig,
    doc: Document,
    log: OpLog,
    presence: PresenceState,
    machine: ConnectionMachine,
    outbox: Vec<ClientMessage>,
    events: Vec<RoomEvent>,
    awaiting_snapshot: bool,
    /// A resync is owed once the next connection opens.
    needs_resync: bool,
    hello_deadline: Option<Instant>,
    next_ping: Option<Instant>,
    ping_sent: Option<Instant>,
    doc_changed: bool,
    presence_changed: bool,
    status_changed: bool,
    history_flags: (bool, bool),
    revision: u64,
}

impl RoomState {
    pub fn new(room: impl Into<String>, actor: ActorId, config: ClientConfig) -> Self {
        Self {
            room: room.into(),
            doc: Document::with_history_depth(actor, config.undo_depth),
            log: OpLog::new(actor, config.max_pending_ops),
            presence: PresenceState::from_config(actor, &config),
            machine: ConnectionMachine::new(),
            config,
            outbox: Vec::new(),
            events: Vec::new(),
            awaiting_snapshot: false,
            needs_resync: false,
            hello_deadline: None,
            next_ping: None,
            ping_sent: None,
            doc_changed: false,
            presence_changed: false,
            status_changed: false,
            history_flags: (false, false),
            revision: 0,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn actor(&self) -> ActorId {
        self.log.actor()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.machine.status()
    }

    pub fn attempts(&self) -> u32 {
        self.machine.attempts()
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Highest committed version applied.
    pub fn version(&self) -> u64 {
        self.log.committed()
    }

    pub fn pending(&self) -> &[Operation] {
        self.log.pending()
    }

    pub fn presence(&self) -> &PresenceState {
        &self.presence
    }

    pub fn snapshot(&self) -> LiveNode {
        self.doc.snapshot()
    }

    // ---- consumer entry points ----------------------------------------------

    /// Run `f` as one undoable unit.
    ///
    /// Edits made before `f` fails stay applied.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut Mutation<'_>) -> Result<R, RoomError>) -> Result<R, RoomError> {
        self.doc.history_mut().begin_batch();
        let result = f(&mut Mutation { state: self });
        self.doc.history_mut().end_batch();
        self.history_changed();
        result
    }

    /// Returns whether there was anything to undo.
    pub fn undo(&mut self) -> Result<bool, RoomError> {
        self.log.next_seq()?;
        let Some(frame) = self.doc.history_mut().pop_undo() else {
            return Ok(false);
        };
        let redo = self.replay(frame);
        self.doc.history_mut().push_redo(redo);
        self.history_changed();
        Ok(true)
    }

    pub fn redo(&mut self) -> Result<bool, RoomError> {
        self.log.next_seq()?;
        let Some(frame) = self.doc.history_mut().pop_redo() else {
            return Ok(false);
        };
        let undo = self.replay(frame);
        self.doc.history_mut().push_undo_keep_redo(undo);
        self.history_changed();
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        self.doc.history().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.doc.history().can_redo()
    }

    /// Merge every edit until [`RoomState::resume_history`] into one undo step.
    pub fn pause_history(&mut self) {
        self.doc.history_mut().pause();
    }

    pub fn resume_history(&mut self) {
        self.doc.history_mut().resume();
        self.history_changed();
    }

    /// Shallow-merge into our presence; sent on the next flush.
    pub fn set_presence(&mut self, patch: Map<String, Value>) {
        self.presence.set_local(patch);
        self.presence_changed = true;
    }

    /// Replay inverse payloads as new local edits. Steps that no longer
    /// apply are skipped.
    fn replay(&mut self, frame: Frame) -> Frame {
        let mut inverse = Frame::new();
        for (target, payload) in frame.into_ops() {
            match self.apply_local(target, payload) {
                Ok((t, p)) => inverse.push_inverse(t, p),
                Err(e) => log::warn!("room {}: skipping history step on {target}: {e}", self.room),
            }
        }
        inverse
    }

    fn apply_local(&mut self, target: NodeId, payload: OpPayload) -> Result<(NodeId, OpPayload), RoomError> {
        let seq = self.log.next_seq()?;
        let op = Operation::new(self.log.actor(), seq, target, payload);
        let inverse = self.doc.apply_local(&op)?;
        self.log.append(op)?;
        self.doc_changed = true;
        self.send_pending();
        Ok(inverse)
    }

    fn history_changed(&mut self) {
        let flags = (self.can_undo(), self.can_redo());
        if flags != self.history_flags {
            self.history_flags = flags;
            self.events.push(RoomEvent::History { can_undo: flags.0, can_redo: flags.1 });
        }
    }

    // ---- connection lifecycle -------------------------------------------------

    pub fn transition(&mut self, event: ConnectionEvent) -> Option<ConnectionStatus> {
        let next = self.machine.handle(event)?;
        match next {
            ConnectionStatus::Unavailable | ConnectionStatus::Closed | ConnectionStatus::Failed => {
                // Whatever was in flight is resent on the next connection.
                self.log.rewind();
                self.outbox.clear();
                self.hello_deadline = None;
                self.next_ping = None;
                self.ping_sent = None;
                if self.awaiting_snapshot {
                    self.awaiting_snapshot = false;
                    self.needs_resync = true;
                }
                if next == ConnectionStatus::Closed {
                    for event in self.presence.clear_peers() {
                        self.events.push(RoomEvent::Presence(event));
                        self.presence_changed = true;
                    }
                }
            }
            _ => {}
        }
        log::info!("room {}: {next}", self.room);
        self.status_changed = true;
        self.events.push(RoomEvent::Status(next));
        Some(next)
    }

    pub fn auth_failed(&mut self, error: AuthError) {
        log::warn!("room {}: {error}", self.room);
        let event = match error {
            AuthError::Rejected(_) => ConnectionEvent::AuthRejected,
            AuthError::Unreachable(_) => ConnectionEvent::TransportLost,
        };
        self.events.push(RoomEvent::Error(error.into()));
        self.transition(event);
    }

    /// First frame of a new connection.
    pub fn hello(&mut self, token: String, now: Instant) -> ClientMessage {
        self.log.rewind();
        self.outbox.clear();
        self.hello_deadline = Some(now + self.config.connect_timeout());
        ClientMessage::Hello {
            room: self.room.clone(),
            actor: self.log.actor(),
            token,
            last_version: self.log.committed(),
        }
    }

    pub fn transport_lost(&mut self) {
        self.transition(ConnectionEvent::TransportLost);
    }

    fn send_pending(&mut self) {
        if self.status().is_connected() {
            let ops = self.log.take_unsent();
            self.outbox.extend(ops.into_iter().map(ClientMessage::Op));
        }
    }

    fn request_snapshot(&mut self) {
        if self.awaiting_snapshot {
            return;
        }
        if self.status().is_connected() {
            log::info!("room {}: requesting snapshot at version {}", self.room, self.log.committed());
            self.outbox.push(ClientMessage::FetchSnapshot);
            self.awaiting_snapshot = true;
        } else {
            self.needs_resync = true;
        }
    }

    // ---- inbound --------------------------------------------------------------

    pub fn handle_message(&mut self, msg: ServerMessage, now: Instant) {
        match msg {
            ServerMessage::Welcome { version } => self.on_welcome(version, now),
            ServerMessage::Op { version, op } => self.on_committed(version, op),
            ServerMessage::Ack { local_seq, version } => self.on_ack(local_seq, version),
            ServerMessage::Reject { local_seq, reason } => {
                if self.log.reject(local_seq).is_some() {
                    log::warn!("room {}: operation {local_seq} rejected: {reason}", self.room);
                    self.doc.rebuild(self.log.pending());
                    self.doc_changed = true;
                    self.events.push(RoomEvent::Error(RoomError::Rejected { local_seq, reason }));
                }
            }
            ServerMessage::Presence { actor, data } => {
                if let Some(event) = self.presence.apply_remote(actor, data.into_value(), now) {
                    self.presence_changed = true;
                    self.events.push(RoomEvent::Presence(event));
                }
            }
            ServerMessage::PeerLeft { actor } => {
                if let Some(event) = self.presence.remove(actor) {
                    self.presence_changed = true;
                    self.events.push(RoomEvent::Presence(event));
                }
            }
            ServerMessage::Snapshot { version, tree, acked_through, rejected } => {
                self.on_snapshot(version, tree, acked_through, rejected)
            }
            ServerMessage::Compact { version } => {
                self.doc.compact(version.min(self.log.committed()));
            }
            ServerMessage::Pong => self.ping_sent = None,
            ServerMessage::Error { code, message } => {
                log::warn!("room {}: authority error {code:?}: {message}", self.room);
                self.events.push(RoomEvent::Error(RoomError::Authority { code, message }));
                match code {
                    ErrorCode::AuthRejected => {
                        self.transition(ConnectionEvent::AuthRejected);
                    }
                    ErrorCode::RoomFull => self.transport_lost(),
                    ErrorCode::Malformed => {}
                }
            }
        }
    }

    fn on_welcome(&mut self, version: u64, now: Instant) {
        if self.transition(ConnectionEvent::Opened).is_none() {
            return;
        }
        self.hello_deadline = None;
        self.ping_sent = None;
        self.next_ping = Some(now + self.config.heartbeat_interval());
        if version < self.log.committed() {
            log::warn!(
                "room {}: authority is at version {version}, behind local {}",
                self.room,
                self.log.committed()
            );
            self.needs_resync = true;
        }
        if std::mem::take(&mut self.needs_resync) {
            self.request_snapshot();
        }
        self.send_pending();
        self.presence.resend();
    }

    fn on_committed(&mut self, version: u64, op: Operation) {
        if self.awaiting_snapshot {
            return;
        }
        let own = op.actor == self.log.actor();
        match self.log.classify(version) {
            Arrival::Stale => {
                log::debug!("room {}: ignoring stale version {version}", self.room);
                if own && self.log.ack(op.local_seq).is_some() {
                    self.doc.rebuild(self.log.pending());
                    self.doc_changed = true;
                }
                return;
            }
            Arrival::Gap => {
                log::warn!("room {}: expected version {}, got {version}", self.room, self.log.committed() + 1);
                self.request_snapshot();
                return;
            }
            Arrival::Next => {}
        }
        if own {
            // Our own operation replayed during catch-up.
            self.log.ack(op.local_seq);
        }
        self.commit(version, &op);
    }

    fn on_ack(&mut self, local_seq: u64, version: u64) {
        if self.awaiting_snapshot {
            return;
        }
        let Some(op) = self.log.ack(local_seq) else {
            if self.log.classify(version) != Arrival::Stale {
                log::warn!("room {}: ack for unknown operation {local_seq}", self.room);
                self.request_snapshot();
            }
            return;
        };
        match self.log.classify(version) {
            Arrival::Stale => {
                self.doc.rebuild(self.log.pending());
                self.doc_changed = true;
            }
            Arrival::Gap => self.request_snapshot(),
            Arrival::Next => self.commit(version, &op),
        }
    }

    fn commit(&mut self, version: u64, op: &Operation) {
        match self.doc.apply_committed(version, op, self.log.pending()) {
            Ok(()) => {
                self.log.set_committed(version);
                self.doc_changed = true;
            }
            Err(e) => {
                log::warn!("room {}: version {version} does not apply ({e}), resynchronising", self.room);
                self.events.push(RoomEvent::Error(e.into()));
                self.request_snapshot();
            }
        }
    }

    fn on_snapshot(&mut self, version: u64, tree: Tree, acked_through: u64, rejected: Vec<(u64, String)>) {
        for (local_seq, reason) in rejected {
            if local_seq <= acked_through && self.log.reject(local_seq).is_some() {
                log::warn!("room {}: operation {local_seq} rejected: {reason}", self.room);
                self.events.push(RoomEvent::Error(RoomError::Rejected { local_seq, reason }));
            }
        }
        let dropped = self.log.ack_through(acked_through);
        self.doc.reset(version, tree, self.log.pending());
        self.log.set_committed(version);
        self.awaiting_snapshot = false;
        self.needs_resync = false;
        self.doc_changed = true;
        log::info!("room {}: resynchronised at version {version} ({dropped} pending settled)", self.room);
        self.events.push(RoomEvent::Resynced { version });
    }

    // ---- timers ---------------------------------------------------------------

    pub fn tick(&mut self, now: Instant) {
        for event in self.presence.expire(now) {
            self.presence_changed = true;
            self.events.push(RoomEvent::Presence(event));
        }

        match self.status() {
            ConnectionStatus::Connecting => {
                if self.hello_deadline.is_some_and(|d| now >= d) {
                    log::warn!("room {}: handshake timed out", self.room);
                    self.transport_lost();
                }
            }
            ConnectionStatus::Connected => {
                if let Some(sent) = self.ping_sent {
                    if now >= sent + self.config.pong_timeout() {
                        log::warn!("room {}: heartbeat missed", self.room);
                        self.transition(ConnectionEvent::HeartbeatMissed);
                        return;
                    }
                } else if self.next_ping.is_some_and(|d| now >= d) {
                    self.outbox.push(ClientMessage::Ping { version: self.log.committed() });
                    self.ping_sent = Some(now);
                    self.next_ping = Some(now + self.config.heartbeat_interval());
                }
                if let Some(data) = self.presence.flush(now) {
                    self.outbox.push(ClientMessage::Presence { data });
                }
            }
            _ => {}
        }
    }

    /// When `tick` next has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines = vec![self.presence.expiry_deadline()];
        match self.status() {
            ConnectionStatus::Connecting => deadlines.push(self.hello_deadline),
            ConnectionStatus::Connected => {
                deadlines.push(self.presence.flush_deadline());
                deadlines.push(match self.ping_sent {
                    Some(sent) => Some(sent + self.config.pong_timeout()),
                    None => self.next_ping,
                });
            }
            _ => {}
        }
        deadlines.into_iter().flatten().min()
    }

    // ---- outputs --------------------------------------------------------------

    pub fn take_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_changes(&mut self) -> Changes {
        self.revision += 1;
        Changes {
            revision: self.revision,
            document: std::mem::take(&mut self.doc_changed).then(|| self.doc.snapshot()),
            presence: std::mem::take(&mut self.presence_changed).then(|| self.presence.view()),
            status: std::mem::take(&mut self.status_changed).then(|| self.machine.status()),
            events: std::mem::take(&mut self.events),
        }
    }
}

/// Edits made inside [`Room::mutate`]. Each call is applied immediately and
/// becomes one operation.
pub struct Mutation<'a> {
    state: &'a mut RoomState,
}

impl Mutation<'_> {
    /// The document as it currently looks, including this mutation's edits.
    pub fn snapshot(&self) -> LiveNode {
        self.state.doc.snapshot()
    }

    pub fn list_len(&self, list: NodeId) -> Result<usize, RoomError> {
        Ok(self.state.doc.list_len(list)?)
    }

    /// Set a field of an Object or an entry of a Map. Returns the id of the
    /// container created when `value` is one.
    pub fn set(&mut self, target: NodeId, key: &str, value: impl Into<Input>) -> Result<Option<NodeId>, RoomError> {
        let payload = self.state.doc.prepare_set(target, key, value.into())?;
        let created = match &payload {
            OpPayload::Set { value: NewValue::Node(init), .. } => Some(init.id),
            _ => None,
        };
        self.record(target, payload)?;
        Ok(created)
    }

    pub fn remove(&mut self, target: NodeId, key: &str) -> Result<(), RoomError> {
        let payload = self.state.doc.prepare_remove(target, key)?;
        self.record(target, payload)
    }

    /// Insert before the item at `index`. Returns the new item's id, which is
    /// also the id of the container when `value` is one.
    pub fn insert(&mut self, list: NodeId, index: usize, value: impl Into<Input>) -> Result<NodeId, RoomError> {
        let payload = self.state.doc.prepare_insert(list, index, value.into())?;
        let item = match &payload {
            OpPayload::Insert { item, .. } => *item,
            _ => list,
        };
        self.record(list, payload)?;
        Ok(item)
    }

    pub fn push(&mut self, list: NodeId, value: impl Into<Input>) -> Result<NodeId, RoomError> {
        let len = self.list_len(list)?;
        self.insert(list, len, value)
    }

    pub fn move_item(&mut self, list: NodeId, from: usize, to: usize) -> Result<(), RoomError> {
        let payload = self.state.doc.prepare_move(list, from, to)?;
        self.record(list, payload)
    }

    pub fn delete(&mut self, list: NodeId, index: usize) -> Result<(), RoomError> {
        let payload = self.state.doc.prepare_delete(list, index)?;
        self.record(list, payload)
    }

    fn record(&mut self, target: NodeId, payload: OpPayload) -> Result<(), RoomError> {
        let (t, inverse) = self.state.apply_local(target, payload)?;
        self.state.doc.history_mut().record(t, inverse);
        Ok(())
    }
}

// ---- async handle ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
    /// Local state changed; send what it produced.
    Flush,
}

struct Shared {
    id: String,
    actor: ActorId,
    state: Mutex<RoomState>,
    document: Store<LiveNode>,
    presence: Store<PresenceView>,
    status: Store<ConnectionStatus>,
    events: broadcast::Sender<RoomEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the state and publish what it changed.
    fn step<R>(&self, f: impl FnOnce(&mut RoomState) -> R) -> R {
        let (result, changes) = {
            let mut state = self.lock();
            let result = f(&mut state);
            (result, state.take_changes())
        };
        self.publish(changes);
        result
    }

    fn publish(&self, changes: Changes) {
        if let Some(document) = changes.document {
            self.document.publish(changes.revision, document);
        }
        if let Some(presence) = changes.presence {
            self.presence.publish(changes.revision, presence);
        }
        if let Some(status) = changes.status {
            self.status.publish(changes.revision, status);
        }
        for event in changes.events {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }
}

pub(crate) struct RoomInner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
}

impl Drop for RoomInner {
    fn drop(&mut self) {
        self.driver.abort();
        log::debug!("room {} destroyed", self.shared.id);
    }
}

/// Handle to a room. Clones share the room; it is destroyed, pending
/// operations included, when the last handle is dropped.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl Room {
    /// Create a room and spawn its driver. Must be called inside a tokio
    /// runtime. The room stays closed until [`Room::connect`].
    pub fn new(id: impl Into<String>, config: ClientConfig, auth: Arc<dyn AuthProvider>) -> Self {
        let id = id.into();
        let actor = ActorId::new();
        let state = RoomState::new(id.clone(), actor, config.clone());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            id,
            actor,
            document: Store::new(state.snapshot()),
            presence: Store::new(PresenceView::default()),
            status: Store::new(ConnectionStatus::Closed),
            state: Mutex::new(state),
            events,
        });
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(shared.clone(), config, auth, rx));
        Self { inner: Arc::new(RoomInner { shared, commands, driver }) }
    }

    pub(crate) fn from_inner(inner: Arc<RoomInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<RoomInner> {
        Arc::downgrade(&self.inner)
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    fn command(&self, command: Command) {
        // Fails only once the driver has stopped.
        let _ = self.inner.commands.send(command);
    }

    pub fn id(&self) -> &str {
        &self.shared().id
    }

    pub fn actor(&self) -> ActorId {
        self.shared().actor
    }

    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the connection. Pending operations are kept for the next
    /// [`Room::connect`].
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared().status.get_snapshot()
    }

    pub fn status_store(&self) -> StoreHandle<ConnectionStatus> {
        self.shared().status.handle()
    }

    pub fn document(&self) -> StoreHandle<LiveNode> {
        self.shared().document.handle()
    }

    pub fn presence(&self) -> StoreHandle<PresenceView> {
        self.shared().presence.handle()
    }

    pub fn get_snapshot(&self) -> Arc<LiveNode> {
        self.shared().document.get_snapshot()
    }

    pub fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.shared().events.subscribe()
    }

    pub fn version(&self) -> u64 {
        self.shared().lock().version()
    }

    /// Local operations the authority has not acknowledged yet.
    pub fn pending_count(&self) -> usize {
        self.shared().lock().pending().len()
    }

    pub fn mutate<R>(&self, f: impl FnOnce(&mut Mutation<'_>) -> Result<R, RoomError>) -> Result<R, RoomError> {
        let result = self.shared().step(|state| state.mutate(f));
        self.command(Command::Flush);
        result
    }

    pub fn undo(&self) -> Result<bool, RoomError> {
        let result = self.shared().step(RoomState::undo);
        self.command(Command::Flush);
        result
    }

    pub fn redo(&self) -> Result<bool, RoomError> {
        let result = self.shared().step(RoomState::redo);
        self.command(Command::Flush);
        result
    }

    pub fn can_undo(&self) -> bool {
        self.shared().lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.shared().lock().can_redo()
    }

    pub fn pause_history(&self) {
        self.shared().lock().pause_history();
    }

    pub fn resume_history(&self) {
        self.shared().step(RoomState::resume_history);
    }

    pub fn set_presence(&self, patch: Map<String, Value>) {
        self.shared().step(|state| state.set_presence(patch));
        self.command(Command::Flush);
    }
}

/// How a connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Left the connected states; the machine says what comes next.
    Ended,
    /// Every room handle is gone.
    Shutdown,
}

async fn drive(
    shared: Arc<Shared>,
    config: ClientConfig,
    auth: Arc<dyn AuthProvider>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let backoff = Backoff::from_config(&config);
    let mut token: Option<String> = None;

    loop {
        let status = shared.lock().status();
        match status {
            ConnectionStatus::Closed | ConnectionStatus::Failed => match commands.recv().await {
                Some(Command::Connect) => {
                    shared.step(|s| s.transition(ConnectionEvent::Connect));
                }
                Some(_) => {}
                None => return,
            },

            ConnectionStatus::Authenticating => {
                tokio::select! {
                    result = auth.token(&shared.id) => match result {
                        Ok(t) => {
                            token = Some(t);
                            shared.step(|s| s.transition(ConnectionEvent::Authenticated));
                        }
                        Err(e) => {
                            if matches!(e, AuthError::Rejected(_)) {
                                token = None;
                            }
                            shared.step(|s| s.auth_failed(e));
                        }
                    },
                    cmd = commands.recv() => match cmd {
                        Some(Command::Disconnect) => {
                            shared.step(|s| s.transition(ConnectionEvent::Disconnect));
                        }
                        Some(_) => {}
                        None => return,
                    }
                }
            }

            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                let Some(t) = token.clone() else {
                    shared.step(|s| s.transport_lost());
                    continue;
                };
                if session(&shared, &config, t, &mut commands).await == SessionEnd::Shutdown {
                    return;
                }
            }

            ConnectionStatus::Unavailable => {
                let attempt = shared.lock().attempts();
                let delay = backoff.next_delay(attempt);
                log::info!("room {}: reconnecting in {delay:?} (attempt {attempt})", shared.id);
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => {
                            shared.step(|s| s.transition(ConnectionEvent::BackoffElapsed));
                            break;
                        }
                        cmd = commands.recv() => match cmd {
                            Some(Command::Connect) => {
                                shared.step(|s| s.transition(ConnectionEvent::Connect));
                                break;
                            }
                            Some(Command::Disconnect) => {
                                shared.step(|s| s.transition(ConnectionEvent::Disconnect));
                                break;
                            }
                            Some(Command::Flush) => {}
                            None => return,
                        }
                    }
                }
            }
        }
    }
}

/// One WebSocket connection, from handshake until it ends.
async fn session(
    shared: &Shared,
    config: &ClientConfig,
    token: String,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let url = format!("{}/{}", config.url.trim_end_matches('/'), shared.id);
    let ws_stream = match tokio::time::timeout(config.connect_timeout(), tokio_tungstenite::connect_async(url.as_str())).await
    {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => {
            log::warn!("room {}: connecting to {url} failed: {e}", shared.id);
            shared.step(RoomState::transport_lost);
            return SessionEnd::Ended;
        }
        Err(_) => {
            log::warn!("room {}: connecting to {url} timed out", shared.id);
            shared.step(RoomState::transport_lost);
            return SessionEnd::Ended;
        }
    };
    log::debug!("room {}: websocket open to {url}", shared.id);

    let (mut sink, mut stream) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Binary(data.into())).await {
                log::debug!("websocket write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let hello = shared.step(|s| s.hello(token, Instant::now()));
    let mut outgoing = vec![hello];

    let end = loop {
        for msg in outgoing.drain(..) {
            match msg.encode() {
                Ok(bytes) => {
                    if out_tx.send(bytes).is_err() {
                        shared.step(RoomState::transport_lost);
                        break;
                    }
                }
                Err(e) => log::error!("room {}: cannot encode {}: {e}", shared.id, msg.name()),
            }
        }

        let (status, deadline) = {
            let state = shared.lock();
            (state.status(), state.next_deadline())
        };
        if !matches!(status, ConnectionStatus::Connecting | ConnectionStatus::Connected) {
            break SessionEnd::Ended;
        }

        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                    Ok(msg) => shared.step(|s| s.handle_message(msg, Instant::now())),
                    Err(e) => log::warn!("room {}: undecodable frame: {e}", shared.id),
                },
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("room {}: connection closed by authority", shared.id);
                    shared.step(RoomState::transport_lost);
                }
                Some(Err(e)) => {
                    log::warn!("room {}: websocket error: {e}", shared.id);
                    shared.step(RoomState::transport_lost);
                }
                Some(Ok(_)) => {}
            },

            cmd = commands.recv() => match cmd {
                Some(Command::Disconnect) => {
                    shared.step(|s| s.transition(ConnectionEvent::Disconnect));
                }
                Some(_) => {}
                None => break SessionEnd::Shutdown,
            },

            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            } => shared.step(|s| s.tick(Instant::now())),
        }

        outgoing = shared.lock().take_outbox();
    };

    drop(out_tx);
    match end {
        SessionEnd::Shutdown => writer.abort(),
        SessionEnd::Ended => {
            if shared.lock().status() == ConnectionStatus::Closed {
                // Let the writer flush and send a close frame.
                let _ = writer.await;
            } else {
                writer.abort();
            }
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveroom_core::Json;
    use serde_json::json;

    fn connected() -> RoomState {
        let mut state = RoomState::new("r1", ActorId::from_u128(1), ClientConfig::default());
        state.transition(ConnectionEvent::Connect);
        state.transition(ConnectionEvent::Authenticated);
        state.hello("t".into(), Instant::now());
        state.handle_message(ServerMessage::Welcome { version: 0 }, Instant::now());
        state.take_outbox();
        state
    }

    fn remote_set(seq: u64, key: &str, v: Value) -> Operation {
        Operation::new(
            ActorId::from_u128(2),
            seq,
            NodeId::ROOT,
            OpPayload::Set { key: key.into(), value: NewValue::Scalar(Json(v)) },
        )
    }

    #[test]
    fn test_local_edit_is_sent_and_acked() {
        let mut state = connected();
        state.mutate(|m| m.set(NodeId::ROOT, "count", json!(1))).unwrap();
        assert_eq!(state.snapshot().to_json(), json!({"count": 1}));

        let out = state.take_outbox();
        assert!(matches!(&out[..], [ClientMessage::Op(op)] if op.local_seq == 1));
        assert_eq!(state.pending().len(), 1);

        state.handle_message(ServerMessage::Ack { local_seq: 1, version: 1 }, Instant::now());
        assert!(state.pending().is_empty());
        assert_eq!(state.version(), 1);
        assert_eq!(state.document().committed_snapshot().to_json(), json!({"count": 1}));
    }

    #[test]
    fn test_offline_edits_wait_for_welcome() {
        let mut state = RoomState::new("r1", ActorId::from_u128(1), ClientConfig::default());
        state.mutate(|m| m.set(NodeId::ROOT, "a", json!(1))).unwrap();
        state.mutate(|m| m.set(NodeId::ROOT, "b", json!(2))).unwrap();
        assert!(state.take_outbox().is_empty());

        state.transition(ConnectionEvent::Connect);
        state.transition(ConnectionEvent::Authenticated);
        let hello = state.hello("t".into(), Instant::now());
        assert!(matches!(hello, ClientMessage::Hello { last_version: 0, .. }));
        assert!(state.take_outbox().is_empty());

        state.handle_message(ServerMessage::Welcome { version: 0 }, Instant::now());
        let seqs: Vec<u64> = state
            .take_outbox()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Op(op) => Some(op.local_seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_lost_connection_resends_unacked() {
        let mut state = connected();
        state.mutate(|m| m.set(NodeId::ROOT, "a", json!(1))).unwrap();
        state.take_outbox();
        state.transport_lost();
        assert_eq!(state.status(), ConnectionStatus::Unavailable);

        state.transition(ConnectionEvent::BackoffElapsed);
        assert_eq!(state.status(), ConnectionStatus::Connecting);
        state.hello("t".into(), Instant::now());
        state.handle_message(ServerMessage::Welcome { version: 0 }, Instant::now());
        assert!(matches!(&state.take_outbox()[..], [ClientMessage::Op(op)] if op.local_seq == 1));
    }

    #[test]
    fn test_remote_ops_apply_in_order_and_stale_are_ignored() {
        let mut state = connected();
        let now = Instant::now();
        state.handle_message(ServerMessage::Op { version: 1, op: remote_set(1, "k", json!("a")) }, now);
        state.handle_message(ServerMessage::Op { version: 1, op: remote_set(1, "k", json!("a")) }, now);
        state.handle_message(ServerMessage::Op { version: 2, op: remote_set(2, "k", json!("b")) }, now);
        assert_eq!(state.version(), 2);
        assert_eq!(state.snapshot().to_json(), json!({"k": "b"}));
    }

    #[test]
    fn test_gap_requests_snapshot() {
        let mut state = connected();
        let now = Instant::now();
        state.handle_message(ServerMessage::Op { version: 3, op: remote_set(1, "k", json!(1)) }, now);
        assert_eq!(state.take_outbox(), vec![ClientMessage::FetchSnapshot]);

        // Dropped while the snapshot is on its way.
        state.handle_message(ServerMessage::Op { version: 4, op: remote_set(2, "k", json!(2)) }, now);
        assert_eq!(state.version(), 0);

        let mut tree = Tree::new();
        let op = remote_set(9, "k", json!("snap"));
        tree.apply(&op, liveroom_core::Stamp::committed(4, &op)).unwrap();
        state.handle_message(ServerMessage::Snapshot { version: 4, tree, acked_through: 0, rejected: Vec::new() }, now);
        assert_eq!(state.version(), 4);
        assert_eq!(state.snapshot().to_json(), json!({"k": "snap"}));
        assert!(state.take_changes().events.contains(&RoomEvent::Resynced { version: 4 }));
    }

    #[test]
    fn test_snapshot_surfaces_rejected_pending_ops() {
        let mut state = connected();
        let now = Instant::now();
        state.mutate(|m| m.set(NodeId::ROOT, "k", json!(1))).unwrap();
        state.mutate(|m| m.set(NodeId::ROOT, "j", json!(2))).unwrap();
        let committed = match &state.take_outbox()[..] {
            [ClientMessage::Op(first), ClientMessage::Op(_)] => first.clone(),
            other => panic!("unexpected outbox {other:?}"),
        };
        state.take_changes();

        let mut tree = Tree::new();
        tree.apply(&committed, liveroom_core::Stamp::committed(1, &committed)).unwrap();
        let rejected = vec![(2, "no".to_string())];
        state.handle_message(ServerMessage::Snapshot { version: 1, tree, acked_through: 2, rejected }, now);

        assert!(state.pending().is_empty());
        assert_eq!(state.snapshot().to_json(), json!({"k": 1}));
        let events = state.take_changes().events;
        assert!(events
            .iter()
            .any(|e| matches!(e, RoomEvent::Error(RoomError::Rejected { local_seq: 2, .. }))));
        assert!(events.contains(&RoomEvent::Resynced { version: 1 }));
    }

    #[test]
    fn test_invalid_remote_op_forces_resync() {
        let mut state = connected();
        let bogus = Operation::new(
            ActorId::from_u128(2),
            1,
            NodeId::new(ActorId::from_u128(2), 40),
            OpPayload::Remove { key: "k".into() },
        );
        state.handle_message(ServerMessage::Op { version: 1, op: bogus }, Instant::now());
        assert_eq!(state.take_outbox(), vec![ClientMessage::FetchSnapshot]);
        let changes = state.take_changes();
        assert!(changes
            .events
            .iter()
            .any(|e| matches!(e, RoomEvent::Error(err) if err.kind() == ErrorKind::ProtocolInconsistency)));
    }

    #[test]
    fn test_reject_rolls_back() {
        let mut state = connected();
        state.mutate(|m| m.set(NodeId::ROOT, "k", json!(1))).unwrap();
        state.handle_message(ServerMessage::Reject { local_seq: 1, reason: "no".into() }, Instant::now());
        assert_eq!(state.snapshot().to_json(), json!({}));
        let events = state.take_changes().events;
        assert!(events.iter().any(|e| matches!(e, RoomEvent::Error(err) if err.kind() == ErrorKind::MutationRejected)));
    }

    #[test]
    fn test_undo_redo_are_new_operations() {
        let mut state = connected();
        state.mutate(|m| m.set(NodeId::ROOT, "k", json!(1))).unwrap();
        state.mutate(|m| m.set(NodeId::ROOT, "k", json!(2))).unwrap();
        state.take_outbox();

        assert!(state.undo().unwrap());
        assert_eq!(state.snapshot().to_json(), json!({"k": 1}));
        assert!(state.can_redo());
        assert!(matches!(&state.take_outbox()[..], [ClientMessage::Op(op)] if op.local_seq == 3));

        assert!(state.redo().unwrap());
        assert_eq!(state.snapshot().to_json(), json!({"k": 2}));
        assert!(!state.can_redo());

        state.undo().unwrap();
        state.undo().unwrap();
        assert_eq!(state.snapshot().to_json(), json!({}));
        assert!(!state.undo().unwrap());
    }

    #[test]
    fn test_mutate_is_one_undo_step() {
        let mut state = connected();
        let list = state
            .mutate(|m| {
                let list = m.set(NodeId::ROOT, "todo", Input::List(Vec::new()))?;
                let list = list.ok_or(RoomError::Protocol(ProtocolError::UnexpectedFrame("set")))?;
                m.push(list, json!("a"))?;
                m.push(list, json!("b"))?;
                Ok(list)
            })
            .unwrap();
        assert_eq!(state.snapshot().to_json(), json!({"todo": ["a", "b"]}));
        assert_eq!(state.document().list_len(list).unwrap(), 2);

        state.undo().unwrap();
        assert_eq!(state.snapshot().to_json(), json!({}));
    }

    #[test]
    fn test_paused_history_merges_mutations() {
        let mut state = connected();
        state.pause_history();
        state.mutate(|m| m.set(NodeId::ROOT, "a", json!(1))).unwrap();
        state.mutate(|m| m.set(NodeId::ROOT, "b", json!(2))).unwrap();
        state.resume_history();
        state.undo().unwrap();
        assert_eq!(state.snapshot().to_json(), json!({}));
    }

    #[test]
    fn test_builder_errors_change_nothing() {
        let mut state = connected();
        let err = state.mutate(|m| m.delete(NodeId::ROOT, 0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(state.pending().is_empty());
        assert!(state.take_outbox().is_empty());
    }

    #[test]
    fn test_heartbeat_and_missed_pong() {
        let mut state = connected();
        let t0 = Instant::now();
        let beat = t0 + state.config.heartbeat_interval() + std::time::Duration::from_secs(1);
        state.tick(beat);
        assert_eq!(state.take_outbox(), vec![ClientMessage::Ping { version: 0 }]);

        state.tick(beat + state.config.pong_timeout());
        assert_eq!(state.status(), ConnectionStatus::Unavailable);
    }

    #[test]
    fn test_pong_clears_heartbeat() {
        let mut state = connected();
        let beat = Instant::now() + state.config.heartbeat_interval() + std::time::Duration::from_secs(1);
        state.tick(beat);
        state.handle_message(ServerMessage::Pong, beat);
        state.tick(beat + state.config.pong_timeout());
        assert_eq!(state.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_presence_flush_and_remote() {
        let mut state = connected();
        let now = Instant::now();
        let mut patch = Map::new();
        patch.insert("cursor".into(), json!(3));
        state.set_presence(patch);
        state.tick(now);
        assert_eq!(state.take_outbox(), vec![ClientMessage::Presence { data: Json(json!({"cursor": 3})) }]);

        let bob = ActorId::from_u128(2);
        state.handle_message(ServerMessage::Presence { actor: bob, data: Json(json!({"x": 1})) }, now);
        assert_eq!(state.presence().peer(bob), Some(&json!({"x": 1})));
        state.handle_message(ServerMessage::PeerLeft { actor: bob }, now);
        assert_eq!(state.presence().peer_count(), 0);
    }

    #[test]
    fn test_auth_rejection_is_fatal() {
        let mut state = RoomState::new("r1", ActorId::from_u128(1), ClientConfig::default());
        state.transition(ConnectionEvent::Connect);
        state.transition(ConnectionEvent::Authenticated);
        state.hello("bad".into(), Instant::now());
        state.handle_message(
            ServerMessage::Error { code: ErrorCode::AuthRejected, message: "invalid token".into() },
            Instant::now(),
        );
        assert_eq!(state.status(), ConnectionStatus::Failed);
        assert!(state.next_deadline().is_none());
    }
}
