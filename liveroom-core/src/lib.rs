//! # liveroom-core — replication engine for shared rooms
//!
//! IO-free building blocks used by `liveroom-collab`:
//!
//! ```text
//! ┌──────────────┐  ops   ┌──────────────┐ snapshots ┌──────────────┐
//! │  Operation   │ ─────► │   Document   │ ────────► │    Store     │ ──► consumers
//! │  (op.rs)     │        │ committed +  │           │ subscribe /  │
//! └──────────────┘        │ pending tree │           │ select       │
//!                         └──────────────┘           └──────▲───────┘
//!                                                           │
//!                         ┌──────────────┐  view            │
//!   requests ───────────► │  CacheStore  │ ─────────────────┘
//!                         │ base + patch │
//!                         └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ids`] / [`position`] — actor and node identity, fractional list keys
//! - [`tree`] — container tree with last-writer-wins fields and tombstones
//! - [`document`] — committed/visible trees, payload builders
//! - [`history`] — undo/redo frames
//! - [`store`] — subscription and selector layer
//! - [`cache`] — optimistic cache and the inbox model

pub mod cache;
pub mod document;
pub mod error;
pub mod history;
pub mod ids;
pub mod op;
pub mod position;
pub mod store;
pub mod tree;
pub mod value;

pub use cache::{CacheError, CacheModel, CacheStore, CacheView, QueryState};
pub use document::{Document, DocumentError};
pub use error::ErrorKind;
pub use history::{Frame, History};
pub use ids::{ActorId, IdGen, NodeId};
pub use op::{ContainerKind, NewValue, NodeInit, OpPayload, Operation, Stamp};
pub use position::{InvalidPosition, Position};
pub use store::{Store, StoreHandle, Subscription};
pub use tree::{ApplyError, Tree};
pub use value::{Input, Json, LiveItem, LiveNode, LiveValue};
