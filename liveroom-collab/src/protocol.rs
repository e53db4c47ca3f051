//! Binary wire protocol between rooms and the authority.
//!
//! Every WebSocket binary frame carries exactly one message, encoded with
//! bincode (serde mode, standard config). JSON payloads travel as JSON text
//! inside the frame via [`Json`].
//!
//! ```text
//! client                                   authority
//!   │ ── Hello { room, actor, token, v } ──► │
//!   │ ◄──────────── Welcome { version } ──── │
//!   │ ◄──── Op* / Snapshot, Presence* ────── │   catch-up
//!   │ ── Op ───────────────────────────────► │
//!   │ ◄──────── Ack { local_seq, version } ─ │   to the origin
//!   │                          Op { v, op } ─► peers
//! ```

use liveroom_core::{ActorId, ErrorKind, Json, Operation, Tree};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages sent by a room to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First frame on every connection.
    Hello {
        room: String,
        actor: ActorId,
        token: String,
        /// Highest committed version the client already holds.
        last_version: u64,
    },
    Op(Operation),
    /// Full presence state of the sending actor.
    Presence { data: Json },
    /// Ask for the authoritative tree after a local inconsistency.
    FetchSnapshot,
    /// Heartbeat. Reports the client's committed version for compaction.
    Ping { version: u64 },
}

/// Messages sent by the authority to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome { version: u64 },
    /// A committed operation.
    Op { version: u64, op: Operation },
    /// The receiver's own operation `local_seq` was committed at `version`.
    Ack { local_seq: u64, version: u64 },
    Reject { local_seq: u64, reason: String },
    Presence { actor: ActorId, data: Json },
    PeerLeft { actor: ActorId },
    /// Authoritative tree at `version`. Operations of the receiving actor up
    /// to `acked_through` are included, except the `rejected` ones.
    Snapshot { version: u64, tree: Tree, acked_through: u64, rejected: Vec<(u64, String)> },
    /// Tombstones up to `version` may be dropped.
    Compact { version: u64 },
    Pong,
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    AuthRejected,
    RoomFull,
    Malformed,
}

impl ErrorCode {
    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::AuthRejected => ErrorKind::Authentication,
            ErrorCode::RoomFull => ErrorKind::TransientNetwork,
            ErrorCode::Malformed => ErrorKind::ProtocolInconsistency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out")]
    Timeout,
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::ConnectionClosed | ProtocolError::Timeout => ErrorKind::TransientNetwork,
            _ => ErrorKind::ProtocolInconsistency,
        }
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::Op(_) => "op",
            ClientMessage::Presence { .. } => "presence",
            ClientMessage::FetchSnapshot => "fetch-snapshot",
            ClientMessage::Ping { .. } => "ping",
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Op { .. } => "op",
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::Reject { .. } => "reject",
            ServerMessage::Presence { .. } => "presence",
            ServerMessage::PeerLeft { .. } => "peer-left",
            ServerMessage::Snapshot { .. } => "snapshot",
            ServerMessage::Compact { .. } => "compact",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}
