//! Errors surfaced by the gateway client and the bridge.

use crate::gateway::protocol::{DecodeError, ErrorShape};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A request id was registered twice. Never expected: ids are fresh UUIDs.
    #[error("duplicate request id: {0}")]
    DuplicateId(String),
    #[error("not connected to gateway")]
    NotConnected,
    #[error("connection to gateway lost")]
    ConnectionLost,
    #[error("connection to gateway closed")]
    ConnectionClosed,
    #[error("request timed out: {method}")]
    Timeout { method: String },
    /// Remote failure (`ok: false`), verbatim from the gateway.
    #[error("gateway error {code}: {message}")]
    Gateway { code: String, message: String },
    #[error("gateway handshake failed: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    Transport(String),
    #[error("encoding frame: {0}")]
    Encode(String),
    #[error("chat turn aborted")]
    Aborted,
}

impl From<ErrorShape> for BridgeError {
    fn from(e: ErrorShape) -> Self {
        BridgeError::Gateway {
            code: e.code,
            message: e.message,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Encode(e.to_string())
    }
}
