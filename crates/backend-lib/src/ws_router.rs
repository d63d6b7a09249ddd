// ============================
// roomhub-backend-lib/src/ws_router.rs
// ============================
//! HTTP routing and WebSocket connection handling.
use crate::error::AppError;
use crate::metrics as metric;
use crate::room_actor::SessionSeed;
use crate::storage::Storage;
use crate::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Room names longer than this are not routable.
pub const MAX_ROOM_NAME_BYTES: usize = 128;

/// Create the HTTP/WebSocket router
pub fn create_router<S: Storage + Clone + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/api/room", post(create_room))
        .route("/api/room/{name}/websocket", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Allocate a fresh unguessable room identifier, returned as text.
async fn create_room() -> String {
    Uuid::new_v4().to_string()
}

fn valid_room_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ROOM_NAME_BYTES
        && !name.bytes().any(|b| b.is_ascii_control())
}

/// Handler for WebSocket upgrades on `/api/room/{name}/websocket`
async fn ws_handler<S: Storage + Clone + 'static>(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState<S>>>,
) -> Response {
    if !valid_room_name(&name) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let player_id = params.get("playerId").cloned();

    counter!(metric::WS_CONNECTION).increment(1);
    gauge!(metric::WS_ACTIVE).increment(1.0);

    ws.on_upgrade(move |socket| handle_connection(socket, state, name, player_id))
        .into_response()
}

async fn handle_connection<S: Storage + Clone + 'static>(
    socket: WebSocket,
    state: Arc<AppState<S>>,
    room_name: String,
    player_id: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Session outbox, pumped to the WebSocket by a dedicated writer task.
    let (client_tx, mut client_rx) =
        mpsc::channel::<Message>(state.settings.room.outbound_buffer);
    let send_task = tokio::spawn(async move {
        while let Some(message) = client_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let session_id = Uuid::new_v4();
    let seed = SessionSeed {
        session_id,
        player_id,
        tx: client_tx.clone(),
    };

    // Inbound frames stay queued in the transport until the attach sequence
    // (snapshots included) has completed; only then does the reader below
    // start forwarding them, in arrival order.
    let handle = match state.rooms.attach(&room_name, &state.storage, seed).await {
        Ok(handle) => handle,
        Err(err) => {
            error!(room = %room_name, %err, "session attach failed");
            let _ = client_tx.send(err.client_frame()).await;
            let _ = client_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "room initialization failed".into(),
                })))
                .await;
            drop(client_tx);
            let _ = send_task.await;
            gauge!(metric::WS_ACTIVE).decrement(1.0);
            return;
        }
    };
    info!(room = %room_name, session = %session_id, "session attached");

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Binary(data) => handle.frame(session_id, data.to_vec()),
            Message::Text(_) => {
                // the steady-state protocol is binary-only; report the
                // violation and keep the session
                warn!(room = %room_name, session = %session_id, "text frame rejected");
                let err = AppError::Protocol("text frames are not supported".to_string());
                if client_tx.send(err.client_frame()).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    handle.detach(session_id);
    counter!(metric::WS_DISCONNECTION).increment(1);
    gauge!(metric::WS_ACTIVE).decrement(1.0);
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::storage::FlatFileStorage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_router_creation() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FlatFileStorage::new(temp_dir.path()).unwrap();
        let state = Arc::new(AppState::new(storage, Settings::default()));

        let _router = create_router(state);
    }

    #[tokio::test]
    async fn test_create_room_returns_unguessable_id() {
        let one = create_room().await;
        let two = create_room().await;
        assert_ne!(one, two);
        assert!(Uuid::parse_str(&one).is_ok());
    }

    #[test]
    fn test_room_name_validation() {
        assert!(valid_room_name("lobby"));
        assert!(valid_room_name(&"x".repeat(MAX_ROOM_NAME_BYTES)));
        assert!(!valid_room_name(""));
        assert!(!valid_room_name(&"x".repeat(MAX_ROOM_NAME_BYTES + 1)));
        assert!(!valid_room_name("with\ncontrol"));
    }
}
