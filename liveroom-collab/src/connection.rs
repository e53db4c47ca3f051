//! Connection lifecycle: status machine, reconnect backoff, authentication.
//!
//! ```text
//!            connect              token               Welcome
//!  Closed ─────────► Authenticating ─────► Connecting ───────► Connected
//!    ▲                 │      │  unreachable   ▲  │ lost           │ │
//!    │ disconnect      │      └────────────────┼──┼──► Unavailable ◄┘ │ lost / missed pong
//!    │ (any state)     │ rejected              └──┼──── backoff ──┘   │
//!    │                 ▼                          ▼ rejected          │
//!    └──────────────  Failed ◄────────────────────┘                   │
//!                                                     disconnect ─────┘
//! ```
//!
//! The machine only decides transitions; the room driver does the IO.

use futures_util::future::{BoxFuture, FutureExt};
use liveroom_core::ErrorKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Closed,
    Authenticating,
    Connecting,
    Connected,
    /// Lost the transport; waiting out a backoff delay before retrying.
    Unavailable,
    /// Credentials were rejected. Only an explicit `connect()` leaves it.
    Failed,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Authenticating => "authenticating",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Unavailable => "unavailable",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Authenticated,
    AuthRejected,
    /// The authority answered the handshake.
    Opened,
    TransportLost,
    HeartbeatMissed,
    BackoffElapsed,
    Disconnect,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    status: ConnectionStatus,
    has_token: bool,
    /// Consecutive failed attempts since the last successful handshake.
    attempts: u32,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self { status: ConnectionStatus::Closed, has_token: false, attempts: 0 }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Drive the machine. Returns the new status when it changed.
    pub fn handle(&mut self, event: ConnectionEvent) -> Option<ConnectionStatus> {
        use ConnectionEvent as E;
        use ConnectionStatus as S;

        let next = match (self.status, event) {
            (_, E::Disconnect) => S::Closed,
            (S::Closed | S::Failed, E::Connect) => {
                self.attempts = 0;
                S::Authenticating
            }
            // Skip the rest of the backoff.
            (S::Unavailable, E::Connect) | (S::Unavailable, E::BackoffElapsed) => {
                if self.has_token {
                    S::Connecting
                } else {
                    S::Authenticating
                }
            }
            (S::Authenticating, E::Authenticated) => {
                self.has_token = true;
                S::Connecting
            }
            (S::Authenticating | S::Connecting, E::AuthRejected) => {
                self.has_token = false;
                S::Failed
            }
            (S::Connecting, E::Opened) => {
                self.attempts = 0;
                S::Connected
            }
            (S::Authenticating | S::Connecting | S::Connected, E::TransportLost)
            | (S::Connected, E::HeartbeatMissed) => {
                self.attempts = self.attempts.saturating_add(1);
                S::Unavailable
            }
            (status, event) => {
                log::trace!("ignoring {event:?} while {status}");
                return None;
            }
        };

        if next == self.status {
            return None;
        }
        log::debug!("connection {} -> {next} on {event:?}", self.status);
        self.status = next;
        Some(next)
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max: max.max(base), jitter: jitter.clamp(0.0, 1.0) }
    }

    pub fn from_config(config: &crate::config::ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.backoff_jitter,
        )
    }

    /// Delay before retry number `attempt` (1-based). `unit_random` in
    /// `[0, 1)` shaves up to `jitter` of the delay off.
    pub fn delay_for(&self, attempt: u32, unit_random: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max);
        capped.mul_f64(1.0 - self.jitter * unit_random.clamp(0.0, 1.0))
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, rand::thread_rng().gen::<f64>())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The credentials were refused. Not retried.
    #[error("authentication rejected: {0}")]
    Rejected(String),
    /// The token source could not be reached.
    #[error("authentication service unreachable: {0}")]
    Unreachable(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Rejected(_) => ErrorKind::Authentication,
            AuthError::Unreachable(_) => ErrorKind::TransientNetwork,
        }
    }
}

/// Supplies the token presented in the handshake.
pub trait AuthProvider: Send + Sync + 'static {
    fn token(&self, room: &str) -> BoxFuture<'static, Result<String, AuthError>>;
}

/// A fixed token for every room.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl AuthProvider for StaticToken {
    fn token(&self, _room: &str) -> BoxFuture<'static, Result<String, AuthError>> {
        let token = self.0.clone();
        async move { Ok(token) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionStatus as S;

    #[test]
    fn test_happy_path() {
        let mut m = ConnectionMachine::new();
        assert_eq!(m.handle(E::Connect), Some(S::Authenticating));
        assert_eq!(m.handle(E::Authenticated), Some(S::Connecting));
        assert_eq!(m.handle(E::Opened), Some(S::Connected));
        assert_eq!(m.handle(E::Disconnect), Some(S::Closed));
    }

    #[test]
    fn test_loss_reconnects_with_cached_token() {
        let mut m = ConnectionMachine::new();
        m.handle(E::Connect);
        m.handle(E::Authenticated);
        m.handle(E::Opened);
        assert_eq!(m.handle(E::HeartbeatMissed), Some(S::Unavailable));
        assert_eq!(m.attempts(), 1);
        assert_eq!(m.handle(E::BackoffElapsed), Some(S::Connecting));
        assert_eq!(m.handle(E::TransportLost), Some(S::Unavailable));
        assert_eq!(m.attempts(), 2);
        m.handle(E::BackoffElapsed);
        assert_eq!(m.handle(E::Opened), Some(S::Connected));
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn test_rejection_is_fatal() {
        let mut m = ConnectionMachine::new();
        m.handle(E::Connect);
        assert_eq!(m.handle(E::AuthRejected), Some(S::Failed));
        assert_eq!(m.handle(E::BackoffElapsed), None);
        assert_eq!(m.handle(E::TransportLost), None);
        assert_eq!(m.status(), S::Failed);
        // Only an explicit connect retries.
        assert_eq!(m.handle(E::Connect), Some(S::Authenticating));
    }

    #[test]
    fn test_rejection_during_handshake_drops_token() {
        let mut m = ConnectionMachine::new();
        m.handle(E::Connect);
        m.handle(E::Authenticated);
        assert_eq!(m.handle(E::AuthRejected), Some(S::Failed));
        m.handle(E::Connect);
        assert_eq!(m.status(), S::Authenticating);
    }

    #[test]
    fn test_unreachable_auth_backs_off() {
        let mut m = ConnectionMachine::new();
        m.handle(E::Connect);
        assert_eq!(m.handle(E::TransportLost), Some(S::Unavailable));
        assert_eq!(m.handle(E::BackoffElapsed), Some(S::Authenticating));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000), 0.25);
        assert_eq!(b.delay_for(1, 0.0), Duration::from_millis(100));
        assert_eq!(b.delay_for(2, 0.0), Duration::from_millis(200));
        assert_eq!(b.delay_for(4, 0.0), Duration::from_millis(800));
        assert_eq!(b.delay_for(5, 0.0), Duration::from_millis(1000));
        assert_eq!(b.delay_for(60, 0.0), Duration::from_millis(1000));
        assert_eq!(b.delay_for(2, 1.0), Duration::from_millis(150));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 0.25);
        for _ in 0..100 {
            let d = b.next_delay(3);
            assert!(d >= Duration::from_millis(300) && d <= Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn test_static_token() {
        let auth = StaticToken::new("abc");
        assert_eq!(auth.token("r1").await.unwrap(), "abc");
        assert_eq!(AuthError::Rejected("x".into()).kind(), ErrorKind::Authentication);
        assert_eq!(AuthError::Unreachable("x".into()).kind(), ErrorKind::TransientNetwork);
    }
}
