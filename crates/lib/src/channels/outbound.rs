//! Outbound side: how replies reach the chat platform.

use crate::routing::SessionKey;
use async_trait::async_trait;

/// Sends text back to a group or private chat. Implemented by the platform adapter.
#[async_trait]
pub trait ChatOutbound: Send + Sync {
    /// Deliver `text` to the conversation `target` identifies (group chat or private chat).
    async fn deliver(&self, target: &SessionKey, text: &str) -> anyhow::Result<()>;
}
