// ============================
// roomhub-backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the roomhub WebSocket server.

pub mod config;
pub mod data;
pub mod doc;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod room;
pub mod room_actor;
pub mod storage;
pub mod ws_router;

use crate::config::Settings;
use crate::room::RoomManager;
use crate::storage::Storage;
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState<S> {
    /// Settings manager
    pub settings: Arc<Settings>,
    /// Storage backend
    pub storage: S,
    /// Live room registry
    pub rooms: RoomManager,
}

impl<S: Storage + Clone + 'static> AppState<S> {
    /// Create a new application state
    pub fn new(storage: S, config: Settings) -> Self {
        Self {
            settings: Arc::new(config),
            storage,
            rooms: RoomManager::new(),
        }
    }
}
