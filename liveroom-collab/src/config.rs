//! Client and authority configuration.
//!
//! Durations are stored as milliseconds so the structs load from any serde
//! format; the accessor methods hand out [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for a client and the rooms it opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Authority WebSocket URL; the room id is appended as a path segment.
    pub url: String,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of each backoff delay that is randomised, in `[0, 1]`.
    pub backoff_jitter: f64,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub presence_throttle_ms: u64,
    pub presence_keepalive_ms: u64,
    pub presence_timeout_ms: u64,
    pub max_pending_ops: usize,
    pub undo_depth: usize,
    /// Capacity of each room's event channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".into(),
            backoff_base_ms: 250,
            backoff_max_ms: 10_000,
            backoff_jitter: 0.25,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 2_000,
            connect_timeout_ms: 10_000,
            presence_throttle_ms: 100,
            presence_keepalive_ms: 10_000,
            presence_timeout_ms: 30_000,
            max_pending_ops: 10_000,
            undo_depth: 100,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn presence_throttle(&self) -> Duration {
        Duration::from_millis(self.presence_throttle_ms)
    }

    pub fn presence_keepalive(&self) -> Duration {
        Duration::from_millis(self.presence_keepalive_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }
}

/// Reference authority settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per connection before it counts as lagging.
    pub broadcast_capacity: usize,
    /// Committed operations kept for catch-up replay.
    pub history_limit: usize,
    /// Connections that send nothing for this long are dropped.
    pub idle_timeout_ms: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".into(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            history_limit: 10_000,
            idle_timeout_ms: 90_000,
        }
    }
}

impl AuthorityConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
