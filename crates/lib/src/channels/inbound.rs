//! Inbound message from the chat platform.

use crate::routing::{ChatPlatform, SessionKey};

/// A message from a QQ user, either in a group or in a private chat.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub platform: ChatPlatform,
    pub group_id: Option<String>,
    pub user_id: String,
    pub text: String,
    /// Images attached to the message; passed to the agent as references in the text.
    pub image_urls: Vec<String>,
}

impl InboundMessage {
    pub fn private(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            platform: ChatPlatform::Private,
            group_id: None,
            user_id: user_id.into(),
            text: text.into(),
            image_urls: Vec::new(),
        }
    }

    pub fn group(
        group_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            platform: ChatPlatform::Group,
            group_id: Some(group_id.into()),
            user_id: user_id.into(),
            text: text.into(),
            image_urls: Vec::new(),
        }
    }

    pub fn with_images(mut self, urls: impl IntoIterator<Item = String>) -> Self {
        self.image_urls.extend(urls);
        self
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::for_message(self.platform, self.group_id.as_deref(), &self.user_id)
    }

    /// Text sent to the agent: the trimmed message followed by one `[image: url]` line per image.
    /// Empty when there is nothing to say.
    pub fn compose_text(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        let text = self.text.trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
        lines.extend(
            self.image_urls
                .iter()
                .map(|u| u.trim())
                .filter(|u| !u.is_empty())
                .map(|u| format!("[image: {}]", u)),
        );
        lines.join("\n")
    }
}
