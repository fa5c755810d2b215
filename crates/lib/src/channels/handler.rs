//! Inbound handler: allow-list gate, chat turn, and the reply sent back to the user.

use crate::bridge::{Bridge, ChatOptions};
use crate::channels::{ChatOutbound, InboundMessage};
use crate::gateway::BridgeError;
use crate::routing::{is_allowed, AllowList};

/// Fixed texts sent instead of a reply. Gateway error payloads are never forwarded to users.
#[derive(Debug, Clone)]
pub struct Notices {
    pub not_connected: String,
    pub timeout: String,
    pub no_response: String,
    pub aborted: String,
    pub failed: String,
}

impl Default for Notices {
    fn default() -> Self {
        Self {
            not_connected: "Moltbot is not connected, please try again later.".to_string(),
            timeout: "Request timed out: Moltbot did not respond in time.".to_string(),
            no_response: "Moltbot returned no response.".to_string(),
            aborted: "The request was aborted.".to_string(),
            failed: "Request failed, please try again later.".to_string(),
        }
    }
}

impl Notices {
    fn for_error(&self, err: &BridgeError) -> &str {
        match err {
            BridgeError::Timeout { .. } => &self.timeout,
            BridgeError::NotConnected
            | BridgeError::ConnectionLost
            | BridgeError::ConnectionClosed => &self.not_connected,
            BridgeError::Aborted => &self.aborted,
            _ => &self.failed,
        }
    }
}

/// Turns inbound chat messages into gateway chat turns.
#[derive(Clone)]
pub struct InboundHandler {
    bridge: Bridge,
    allow_list: AllowList,
    deny_reply: Option<String>,
    notices: Notices,
}

impl InboundHandler {
    pub fn new(bridge: Bridge, allow_list: AllowList) -> Self {
        Self {
            bridge,
            allow_list,
            deny_reply: None,
            notices: Notices::default(),
        }
    }

    /// Text sent to users outside the allow-list. Without it they get no reply at all.
    pub fn with_deny_reply(mut self, reply: Option<String>) -> Self {
        self.deny_reply = reply.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn with_notices(mut self, notices: Notices) -> Self {
        self.notices = notices;
        self
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// What to answer for `msg`. `None` means stay silent.
    pub async fn reply_for(&self, msg: &InboundMessage) -> Option<String> {
        if !is_allowed(&msg.user_id, &self.allow_list) {
            log::info!("inbound: user {} not in allow-list", msg.user_id);
            return self.deny_reply.clone();
        }
        let text = msg.compose_text();
        if text.is_empty() {
            log::debug!("inbound: empty message from {}, ignoring", msg.user_id);
            return None;
        }
        if !self.bridge.client().is_ready() {
            return Some(self.notices.not_connected.clone());
        }
        let session = msg.session_key();
        match self.bridge.chat(&session, &text, ChatOptions::default()).await {
            Ok(Some(reply)) => Some(reply),
            Ok(None) => Some(self.notices.no_response.clone()),
            Err(e) => {
                log::warn!("inbound: chat turn for {} failed: {}", session, e);
                Some(self.notices.for_error(&e).to_string())
            }
        }
    }

    /// Handle one message and deliver the answer, if any, to where it came from.
    pub async fn handle(&self, msg: &InboundMessage, out: &dyn ChatOutbound) -> anyhow::Result<()> {
        if let Some(reply) = self.reply_for(msg).await {
            out.deliver(&msg.session_key(), &reply).await?;
        }
        Ok(())
    }
}
