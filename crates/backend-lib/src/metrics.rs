// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for Prometheus metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_DISCONNECTION: &str = "ws.disconnection";
pub const WS_ACTIVE: &str = "ws.active";
pub const ROOM_CREATED: &str = "room.created";
pub const ROOM_ACTIVE: &str = "room.active";
pub const ROOM_EVICTED: &str = "room.evicted";
pub const FRAME_DISPATCHED: &str = "frame.dispatched";
pub const DATA_ROLLBACK: &str = "data.rollback";
pub const DOC_PERSISTED: &str = "doc.persisted";
pub const LOCK_GRANTED: &str = "lock.granted";
pub const SEND_FAILED: &str = "send.failed";
