//! Gateway WebSocket protocol: request/response/event frames and the connect handshake payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version announced in `connect` (min and max).
pub const PROTOCOL_VERSION: u32 = 3;

/// A single wire frame, discriminated by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(WsRequest),
    #[serde(rename = "res")]
    Response(WsResponse),
    #[serde(rename = "event")]
    Event(WsEvent),
}

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsRequest {
    pub id: String,
    pub method: String,
    #[serde(default = "empty_object")]
    pub params: Value,
}

/// Wire response: `{ "type": "res", "id", "ok", "payload" or "error" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsResponse {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Wire event: `{ "type": "event", "event", "payload" }`. Unsolicited, no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsEvent {
    pub event: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

/// Structured error carried by an `ok: false` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    #[serde(default = "unknown_code")]
    pub code: String,
    #[serde(default = "unknown_message")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn unknown_code() -> String {
    "UNKNOWN".to_string()
}

fn unknown_message() -> String {
    "unknown error".to_string()
}

/// A frame that could not be decoded. The receive loop logs and drops it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("malformed frame: {reason}")]
pub struct DecodeError {
    pub raw: String,
    pub reason: String,
}

impl DecodeError {
    fn new(raw: &str, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

/// Decode one text frame. Unknown extra fields are ignored.
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| DecodeError::new(text, e.to_string()))?;
    if let Frame::Response(ref res) = frame {
        match (res.ok, res.payload.is_some(), res.error.is_some()) {
            (true, false, _) => return Err(DecodeError::new(text, "ok response without payload")),
            (false, _, false) => {
                return Err(DecodeError::new(text, "error response without error object"))
            }
            _ => {}
        }
    }
    Ok(frame)
}

/// Encode a frame to its JSON text form.
pub fn encode(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

impl Frame {
    /// Build a request frame with a fresh UUID v4 id.
    pub fn request(method: impl Into<String>, params: Value) -> Self {
        Frame::Request(WsRequest {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        })
    }

    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Frame::Event(WsEvent {
            event: name.into(),
            payload,
        })
    }
}

impl WsResponse {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.into(),
                message: message.into(),
                details: None,
                retryable: None,
            }),
        }
    }

    /// Split into the payload (ok) or the remote error (not ok).
    pub fn into_result(self) -> Result<Value, ErrorShape> {
        if self.ok {
            Ok(self.payload.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| ErrorShape {
                code: unknown_code(),
                message: unknown_message(),
                details: None,
                retryable: None,
            }))
        }
    }
}

/// Client connect params sent as the first request on a socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ConnectClient,
    #[serde(default)]
    pub caps: Vec<String>,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectParams {
    /// Backend operator connect for the given client name/version. `auth` is only set when a credential is present.
    pub fn operator(
        client_name: &str,
        client_version: &str,
        token: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let auth = if token.is_some() || password.is_some() {
            Some(ConnectAuth {
                token: token.map(str::to_string),
                password: password.map(str::to_string),
            })
        } else {
            None
        };
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ConnectClient {
                id: client_name.to_string(),
                version: client_version.to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: "backend".to_string(),
            },
            caps: Vec::new(),
            role: "operator".to_string(),
            scopes: vec!["operator.admin".to_string()],
            auth,
        }
    }
}

/// Server hello payload after a successful connect. Only the fields we read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default)]
    pub policy: Option<HelloPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    pub tick_interval_ms: Option<u64>,
}
