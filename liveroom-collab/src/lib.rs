//! # liveroom-collab — rooms over WebSocket
//!
//! Client and authority halves of the replication protocol built on
//! `liveroom-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌────────────────┐
//! │   Room      │ ◄─────────────────► │ AuthorityServer│
//! │ (per room,  │    bincode frames   │  (central)     │
//! │  per client)│                     └───────┬────────┘
//! └──────┬──────┘                             │
//!        │                                    ▼
//!        ▼                            ┌────────────────┐
//! ┌─────────────┐                     │ AuthorityRoom  │
//! │ RoomState   │                     │ total order,   │
//! │ doc · oplog │                     │ ack / reject   │
//! │ presence    │                     └───────┬────────┘
//! └─────────────┘                             │
//!                                     ┌───────┴────────┐
//!                                     │ BroadcastGroup │
//!                                     │ (fan-out)      │
//!                                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — wire messages (bincode-encoded)
//! - [`connection`] — status machine, backoff, authentication
//! - [`oplog`] — local sequence numbers and the pending buffer
//! - [`presence`] — ephemeral per-actor state
//! - [`room`] — sans-IO room state and its async driver
//! - [`client`] — room registry
//! - [`authority`] — the ordering server
//! - [`broadcast`] — per-room fan-out and the room registry on the server

pub mod authority;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod room;

pub use authority::{AuthorityRoom, AuthorityServer, JoinError, Outbound, Recipient, ServerStats, TokenValidator};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use client::Client;
pub use config::{AuthorityConfig, ClientConfig};
pub use connection::{AuthError, AuthProvider, Backoff, ConnectionEvent, ConnectionMachine, ConnectionStatus, StaticToken};
pub use oplog::{Arrival, OpLog, OpLogError};
pub use presence::{PresenceEvent, PresenceState, PresenceView};
pub use protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
pub use room::{Changes, Mutation, Room, RoomError, RoomEvent, RoomState};
