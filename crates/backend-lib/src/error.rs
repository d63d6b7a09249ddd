// ============================
// roomhub-backend-lib/src/error.rs
// ============================
//! Central error type + Axum integration.
use axum::{
    extract::ws::Message,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use roomhub_common::FrameError;
use thiserror::Error;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid room name")]
    InvalidRoomName,

    #[error("Room is shutting down")]
    RoomClosed,
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRoomName => StatusCode::NOT_FOUND,
            AppError::Frame(_) | AppError::Protocol(_) => StatusCode::BAD_REQUEST,
            AppError::RoomClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "INT_001",
            AppError::Storage(_) => "STO_001",
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "JSON_001",
            AppError::Frame(_) => "FRAME_001",
            AppError::Protocol(_) => "PROTO_001",
            AppError::InvalidRoomName => "ROOM_001",
            AppError::RoomClosed => "ROOM_002",
        }
    }

    /// Serialize this error as the JSON `{error}` frame sent to a client
    /// over an established WebSocket.
    pub fn client_frame(&self) -> Message {
        let body = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            }
        });
        Message::Text(body.to_string().into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::Internal("Failed to send message".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_by_category() {
        assert_eq!(AppError::InvalidRoomName.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Protocol("text frame".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Storage("disk".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(AppError::RoomClosed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn client_frame_is_json_error_text() {
        let frame = AppError::Protocol("text frames are not supported".into()).client_frame();
        let Message::Text(text) = frame else {
            panic!("expected a text frame");
        };
        let parsed: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(parsed["error"]["code"], "PROTO_001");
        assert!(parsed["error"]["message"]
            .as_str()
            .unwrap()
            .contains("text frames"));
    }
}
