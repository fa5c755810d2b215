//! Bridge facade: the calls the chat integration makes against the gateway.
//!
//! `send_chat` is the plain request/response form of `chat.send`. `chat` runs a whole turn:
//! the gateway acknowledges `chat.send` and then streams the answer back as `chat` events
//! (`delta` ... `final`), which are collected here by a temporary handler for the session.

use crate::gateway::{
    handler_fn, BridgeError, ConnectionState, EventDispatcher, EventHandler, GatewayClient,
    HandlerId, WsEvent,
};
use crate::routing::SessionKey;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Event carrying streamed chat state for a session.
pub const CHAT_EVENT: &str = "chat";
/// Default event name for gateway-initiated messages to forward to chat.
pub const DEFAULT_PUSH_EVENT: &str = "chat.push";

const CHAT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Called with the running reply text on every `delta`.
pub type DeltaCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Image passed to the agent inline (base64 content).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub mime_type: String,
    pub content: String,
}

impl ImageAttachment {
    pub fn new(mime_type: impl Into<String>, base64: impl Into<String>) -> Self {
        Self {
            typ: "image",
            mime_type: mime_type.into(),
            content: base64.into(),
        }
    }
}

/// Optional knobs for a chat turn.
#[derive(Clone, Default)]
pub struct ChatOptions {
    /// Thinking level passed through to the agent (e.g. "off", "low", "high").
    pub thinking: Option<String>,
    pub attachments: Vec<ImageAttachment>,
    pub on_delta: Option<DeltaCallback>,
}

/// Params for `agent`.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub message: String,
    pub session: Option<SessionKey>,
    pub agent_id: Option<String>,
    pub thinking: Option<String>,
}

/// Facade over one [`GatewayClient`]. Cheap to clone.
#[derive(Clone)]
pub struct Bridge {
    client: GatewayClient,
    timeout: Duration,
    agent_timeout: Duration,
    push_event: String,
}

impl Bridge {
    /// `timeout` bounds each reply, counted from the send.
    pub fn new(client: GatewayClient, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            push_event: DEFAULT_PUSH_EVENT.to_string(),
        }
    }

    pub fn with_push_event(mut self, event: impl Into<String>) -> Self {
        self.push_event = event.into();
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn client(&self) -> &GatewayClient {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn push_event(&self) -> &str {
        &self.push_event
    }

    /// `chat.send` for the session; returns the response payload.
    pub async fn send_chat(&self, session: &SessionKey, text: &str) -> Result<Value, BridgeError> {
        let params = chat_params(session, text, &ChatOptions::default());
        self.client.request_timeout("chat.send", params, self.timeout).await
    }

    /// Run one chat turn and return the final reply text (`None` when the agent said nothing).
    pub async fn chat(
        &self,
        session: &SessionKey,
        text: &str,
        options: ChatOptions,
    ) -> Result<Option<String>, BridgeError> {
        if !self.client.is_ready() {
            return Err(BridgeError::NotConnected);
        }
        let deadline = Instant::now() + self.timeout;
        let key = session.to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _registration = Registration::new(
            self.client.events(),
            CHAT_EVENT,
            session_filter(key.clone(), tx),
        );

        log::debug!("bridge: chat.send for {}", key);
        let ack_timeout = CHAT_ACK_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
        let ack = self
            .client
            .request_timeout("chat.send", chat_params(session, text, &options), ack_timeout)
            .await?;
        if ack.get("status").and_then(Value::as_str) == Some("error") {
            let summary = ack
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(BridgeError::Gateway {
                code: "CHAT_SEND_FAILED".to_string(),
                message: summary.to_string(),
            });
        }

        // Events for this session that arrived before the ack stay queued in `rx`;
        // once the run id is known, another turn's events on the same session are skipped.
        let run_id = ack.get("runId").and_then(Value::as_str).map(str::to_string);
        let mut state = self.client.subscribe_state();
        let mut reply = String::new();
        loop {
            let payload = tokio::select! {
                received = rx.recv() => match received {
                    Some(payload) => payload,
                    None => return Err(BridgeError::ConnectionClosed),
                },
                _ = async { let _ = state.wait_for(|s| *s != ConnectionState::Ready).await; } => {
                    return Err(if self.client.is_closed() {
                        BridgeError::ConnectionClosed
                    } else {
                        BridgeError::ConnectionLost
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!("bridge: no final chat event for {} within {:?}", key, self.timeout);
                    return Err(BridgeError::Timeout { method: "chat.send".to_string() });
                }
            };
            if let (Some(ours), Some(theirs)) =
                (run_id.as_deref(), payload.get("runId").and_then(Value::as_str))
            {
                if ours != theirs {
                    log::debug!("bridge: skipping chat event of run {} on {}", theirs, key);
                    continue;
                }
            }
            match payload.get("state").and_then(Value::as_str) {
                Some("delta") => {
                    if let Some(latest) = last_text(&payload) {
                        reply = latest;
                        if let Some(on_delta) = options.on_delta.as_ref() {
                            on_delta(&reply);
                        }
                    }
                }
                Some("final") => {
                    if let Some(latest) = last_text(&payload) {
                        reply = latest;
                    }
                    log::info!("bridge: final reply for {} ({} chars)", key, reply.chars().count());
                    let reply = reply.trim();
                    return Ok((!reply.is_empty()).then(|| reply.to_string()));
                }
                Some("error") => {
                    let message = payload
                        .get("errorMessage")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    log::warn!("bridge: chat error for {}: {}", key, message);
                    return Err(BridgeError::Gateway {
                        code: "CHAT_ERROR".to_string(),
                        message: message.to_string(),
                    });
                }
                Some("aborted") => {
                    log::warn!("bridge: chat for {} aborted", key);
                    return Err(BridgeError::Aborted);
                }
                other => log::debug!("bridge: ignoring chat state {:?} for {}", other, key),
            }
        }
    }

    /// `chat.history` for the session.
    pub async fn chat_history(
        &self,
        session: &SessionKey,
        limit: Option<u32>,
    ) -> Result<Value, BridgeError> {
        let mut params = json!({ "sessionKey": session.to_string() });
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        self.client.request_timeout("chat.history", params, self.timeout).await
    }

    /// Run the agent once and wait for its final response; returns `text` or `response`.
    pub async fn agent(&self, request: AgentRequest) -> Result<Option<String>, BridgeError> {
        let mut params = json!({
            "message": request.message,
            "idempotencyKey": uuid::Uuid::new_v4().to_string(),
        });
        if let Some(session) = request.session {
            params["sessionKey"] = json!(session.to_string());
        }
        if let Some(agent_id) = request.agent_id {
            params["agentId"] = json!(agent_id);
        }
        if let Some(thinking) = request.thinking {
            params["thinking"] = json!(thinking);
        }
        let payload = self
            .client
            .request_final("agent", params, self.agent_timeout)
            .await?;
        let text = ["text", "response"]
            .iter()
            .find_map(|k| payload.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Ok(text)
    }

    /// `send`: deliver a message to a target on one of the gateway's own channels.
    pub async fn send_message(
        &self,
        to: &str,
        message: &str,
        channel: Option<&str>,
        account_id: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let mut params = json!({
            "to": to,
            "message": message,
            "idempotencyKey": uuid::Uuid::new_v4().to_string(),
        });
        if let Some(channel) = channel {
            params["channel"] = json!(channel);
        }
        if let Some(account_id) = account_id {
            params["accountId"] = json!(account_id);
        }
        self.client.request_timeout("send", params, self.timeout).await
    }

    /// Register a handler for gateway-initiated pushes.
    pub fn on_push(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.client.events().on(self.push_event.clone(), handler)
    }
}

fn chat_params(session: &SessionKey, text: &str, options: &ChatOptions) -> Value {
    let mut params = json!({
        "sessionKey": session.to_string(),
        "message": text,
        "idempotencyKey": uuid::Uuid::new_v4().to_string(),
    });
    if let Some(thinking) = options.thinking.as_deref() {
        params["thinking"] = json!(thinking);
    }
    if !options.attachments.is_empty() {
        params["attachments"] = json!(options.attachments);
    }
    params
}

/// Forward `chat` event payloads for one session key into `tx`.
fn session_filter(key: String, tx: mpsc::UnboundedSender<Value>) -> Arc<dyn EventHandler> {
    handler_fn(move |ev: WsEvent| {
        let matches = ev.payload.get("sessionKey").and_then(Value::as_str) == Some(key.as_str());
        if matches {
            let _ = tx.send(ev.payload);
        }
        async { Ok::<(), anyhow::Error>(()) }
    })
}

/// Text of the last `text` content item in `payload.message.content`.
fn last_text(payload: &Value) -> Option<String> {
    payload
        .get("message")?
        .get("content")?
        .as_array()?
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .last()
        .map(str::to_string)
}

/// Handler registration removed on drop, so every exit path of a turn unregisters.
struct Registration {
    events: EventDispatcher,
    id: HandlerId,
}

impl Registration {
    fn new(events: &EventDispatcher, event: &str, handler: Arc<dyn EventHandler>) -> Self {
        let id = events.on(event, handler);
        Self {
            events: events.clone(),
            id,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.events.off(self.id);
    }
}
