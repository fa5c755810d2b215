//! Gateway-initiated messages forwarded to the chat platform.

use crate::channels::ChatOutbound;
use crate::gateway::{EventHandler, WsEvent};
use crate::routing::SessionKey;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Event handler for the push event: `{sessionKey, text | message}` -> [`ChatOutbound::deliver`].
pub struct PushForwarder {
    out: Arc<dyn ChatOutbound>,
}

impl PushForwarder {
    pub fn new(out: Arc<dyn ChatOutbound>) -> Self {
        Self { out }
    }
}

#[async_trait]
impl EventHandler for PushForwarder {
    async fn handle(&self, event: &WsEvent) -> anyhow::Result<()> {
        let key = event
            .payload
            .get("sessionKey")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("push without sessionKey"))?;
        let Some(target) = SessionKey::parse(key) else {
            log::debug!("push: ignoring foreign session key {}", key);
            return Ok(());
        };
        let text = ["text", "message"]
            .iter()
            .find_map(|k| event.payload.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .unwrap_or_default();
        if text.is_empty() {
            log::debug!("push: empty text for {}", key);
            return Ok(());
        }
        self.out.deliver(&target, text).await
    }
}
