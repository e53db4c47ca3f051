//! Entry point for consumers: one [`Client`] per process, one [`Room`] per
//! room id.
//!
//! The client only keeps weak references, so a room lives exactly as long as
//! some consumer holds a handle to it. Entering a room that is still alive
//! returns the same room.

use crate::config::ClientConfig;
use crate::connection::AuthProvider;
use crate::room::{Room, RoomInner};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

pub struct Client {
    config: ClientConfig,
    auth: Arc<dyn AuthProvider>,
    rooms: Mutex<HashMap<String, Weak<RoomInner>>>,
}

impl Client {
    pub fn new(config: ClientConfig, auth: Arc<dyn AuthProvider>) -> Self {
        Self { config, auth, rooms: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get or create the room and start connecting it.
    ///
    /// Must be called inside a tokio runtime.
    pub fn enter(&self, room_id: &str) -> Room {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.retain(|_, room| room.strong_count() > 0);

        if let Some(inner) = rooms.get(room_id).and_then(Weak::upgrade) {
            return Room::from_inner(inner);
        }

        log::info!("entering room {room_id}");
        let room = Room::new(room_id, self.config.clone(), self.auth.clone());
        rooms.insert(room_id.to_string(), room.downgrade());
        room.connect();
        room
    }

    /// The room if some handle to it is still alive.
    pub fn get_room(&self, room_id: &str) -> Option<Room> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.get(room_id).and_then(Weak::upgrade).map(Room::from_inner)
    }

    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.values().filter(|room| room.strong_count() > 0).count()
    }
}
