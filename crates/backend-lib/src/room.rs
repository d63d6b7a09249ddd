// ============================
// roomhub-backend-lib/src/room.rs
// ============================
//! Room registry and actor coordination.
use crate::error::AppError;
use crate::metrics as metric;
use crate::room_actor::{spawn_room_actor, RoomHandle, SessionSeed};
use crate::storage::Storage;
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::Arc;
use tracing::debug;

/// Registry of live rooms
#[derive(Clone)]
pub struct RoomManager {
    rooms: Arc<DashMap<String, RoomHandle>>,
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomManager {
    /// Create a new room manager
    pub fn new() -> Self {
        RoomManager {
            rooms: Arc::new(DashMap::new()),
        }
    }

    /// Get the handle for a room, spawning its actor if absent. The entry
    /// API gives get-or-create-once semantics: concurrent first-accessors
    /// share one actor, and the actor reads storage exactly once.
    pub fn get_or_create<S: Storage + Clone + 'static>(
        &self,
        room_name: &str,
        storage: &S,
    ) -> RoomHandle {
        if let Some(handle) = self.rooms.get(room_name) {
            return handle.clone();
        }
        self.rooms
            .entry(room_name.to_string())
            .or_insert_with(|| {
                counter!(metric::ROOM_CREATED).increment(1);
                gauge!(metric::ROOM_ACTIVE).increment(1.0);
                debug!(room = %room_name, "room created");
                spawn_room_actor(room_name, storage.clone(), self.rooms.clone())
            })
            .clone()
    }

    /// Attach a session to a room, retrying when the target actor is midway
    /// through an idle teardown.
    pub async fn attach<S: Storage + Clone + 'static>(
        &self,
        room_name: &str,
        storage: &S,
        seed: SessionSeed,
    ) -> Result<RoomHandle, AppError> {
        const MAX_ATTEMPTS: usize = 3;

        for _ in 0..MAX_ATTEMPTS {
            let handle = self.get_or_create(room_name, storage);
            match handle.attach(seed.clone()).await {
                Ok(()) => return Ok(handle),
                Err(AppError::RoomClosed) => {
                    // lost the race with a teardown; evict the stale handle
                    // and try again against a fresh actor
                    self.rooms.remove_if(room_name, |_, h| h.is_closed());
                }
                Err(err) => return Err(err),
            }
        }
        Err(AppError::RoomClosed)
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
