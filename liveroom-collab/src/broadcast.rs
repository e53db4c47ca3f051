//! Per-room fan-out on tokio broadcast channels, and the room registry.
//!
//! Every connection in a room holds one receiver of the room's channel, so a
//! single send reaches all of them in the same order. A receiver that falls
//! more than `capacity` messages behind is lagging; the caller decides what
//! to do with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup<T> {
    sender: broadcast::Sender<T>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl<T: Clone> BroadcastGroup<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity, stats: AtomicBroadcastStats::default() }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Send to every current receiver. Returns how many there were.
    pub fn send(&self, msg: T) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(msg).unwrap_or(0)
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.receiver_count(),
        }
    }
}

/// Rooms by name.
pub struct RoomManager<R> {
    rooms: RwLock<HashMap<String, Arc<R>>>,
}

impl<R> Default for RoomManager<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> RoomManager<R> {
    pub fn new() -> Self {
        Self { rooms: RwLock::new(HashMap::new()) }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<R>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn get_or_create(&self, name: &str, create: impl FnOnce() -> R) -> Arc<R> {
        self.enter(name, create, |_| ()).await.0
    }

    /// Look up or create a room and run `enter` on it while the registry is
    /// locked, so a concurrent `remove_if` sees its effect.
    pub async fn enter<T>(&self, name: &str, create: impl FnOnce() -> R, enter: impl FnOnce(&R) -> T) -> (Arc<R>, T) {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                let entered = enter(room);
                return (room.clone(), entered);
            }
        }

        let mut rooms = self.rooms.write().await;
        // Someone may have created it between the two locks.
        let room = rooms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(create()))
            .clone();
        let entered = enter(&room);
        (room, entered)
    }

    /// Remove the room if `is_empty` holds for it under the write lock.
    pub async fn remove_if(&self, name: &str, is_empty: impl FnOnce(&R) -> bool) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get(name) {
            Some(room) if is_empty(room) => {
                rooms.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
