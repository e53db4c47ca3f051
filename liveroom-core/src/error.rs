//! Error classification shared by every layer.
//!
//! Each concrete error type (`DocumentError`, `CacheError`, the collab crate's
//! `RoomError`, ...) reports which of these classes it belongs to, so callers
//! can decide between retrying, resynchronising and surfacing the failure.

use serde::{Deserialize, Serialize};

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection trouble. Operations stay buffered and the connection retries
    /// with backoff; no data is lost.
    TransientNetwork,
    /// Credentials were rejected. Fatal, never retried automatically.
    Authentication,
    /// A remote operation was stale or did not fit the local replica.
    /// Handled by forcing a resynchronisation.
    ProtocolInconsistency,
    /// The server declined a mutation; the optimistic update was rolled back.
    MutationRejected,
    /// A fetch failed. The last known server data is kept.
    QueryFailed,
    /// The caller referenced something that does not exist locally.
    Integrity,
}

impl ErrorKind {
    /// Whether the failure goes away on its own (reconnect, resync).
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork | ErrorKind::ProtocolInconsistency | ErrorKind::QueryFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_is_fatal() {
        assert!(!ErrorKind::Authentication.is_recoverable());
        assert!(!ErrorKind::Integrity.is_recoverable());
        assert!(ErrorKind::TransientNetwork.is_recoverable());
    }
}
