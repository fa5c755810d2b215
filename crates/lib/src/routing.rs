//! Chat identity -> gateway session key, and the user allow-list gate.
//!
//! Session keys are derived per message and never stored:
//! `qq:group:{group_id}:{user_id}` for group chats, `qq:private:{user_id}` for private chats.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

const PREFIX: &str = "qq";

/// Where a chat message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatPlatform {
    Group,
    Private,
}

/// A chat conversation context on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Group { group_id: String, user_id: String },
    Private { user_id: String },
}

impl SessionKey {
    pub fn group(group_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        SessionKey::Group {
            group_id: group_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn private(user_id: impl Into<String>) -> Self {
        SessionKey::Private {
            user_id: user_id.into(),
        }
    }

    /// Key for a message. A group message without a group id falls back to the private key.
    pub fn for_message(platform: ChatPlatform, group_id: Option<&str>, user_id: &str) -> Self {
        match (platform, group_id) {
            (ChatPlatform::Group, Some(group_id)) => SessionKey::group(group_id, user_id),
            _ => SessionKey::private(user_id),
        }
    }

    pub fn platform(&self) -> ChatPlatform {
        match self {
            SessionKey::Group { .. } => ChatPlatform::Group,
            SessionKey::Private { .. } => ChatPlatform::Private,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            SessionKey::Group { user_id, .. } | SessionKey::Private { user_id } => user_id,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        match self {
            SessionKey::Group { group_id, .. } => Some(group_id),
            SessionKey::Private { .. } => None,
        }
    }

    /// Parse the string form back (used for gateway-initiated pushes). `None` for foreign keys.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.split(':');
        if parts.next()? != PREFIX {
            return None;
        }
        let parsed = match (parts.next()?, parts.next(), parts.next(), parts.next()) {
            ("group", Some(group_id), Some(user_id), None) => SessionKey::group(group_id, user_id),
            ("private", Some(user_id), None, None) => SessionKey::private(user_id),
            _ => return None,
        };
        let has_blank = parsed.user_id().is_empty() || parsed.group_id() == Some("");
        (!has_blank).then_some(parsed)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Group { group_id, user_id } => {
                write!(f, "{}:group:{}:{}", PREFIX, group_id, user_id)
            }
            SessionKey::Private { user_id } => write!(f, "{}:private:{}", PREFIX, user_id),
        }
    }
}

/// Session key string for a chat message.
pub fn session_key_for(platform: ChatPlatform, group_id: Option<&str>, user_id: &str) -> String {
    SessionKey::for_message(platform, group_id, user_id).to_string()
}

/// Permitted user ids. Empty means everyone is allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList(BTreeSet<String>);

impl AllowList {
    /// Allow everyone.
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list. Blank entries are ignored.
    pub fn parse(list: &str) -> Self {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.0.contains(user_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        AllowList(iter.into_iter().map(Into::into).collect())
    }
}

/// True iff the list is empty or contains the user.
pub fn is_allowed(user_id: &str, allow_list: &AllowList) -> bool {
    allow_list.is_unrestricted() || allow_list.contains(user_id)
}

impl Serialize for AllowList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

/// Accepts `"1, 2"`, `[1, "2"]`, a single integer, or null.
impl<'de> Deserialize<'de> for AllowList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AllowListVisitor;

        impl<'de> Visitor<'de> for AllowListVisitor {
            type Value = AllowList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a comma-separated string, a list of user ids, or a single user id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<AllowList, E> {
                Ok(AllowList::parse(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<AllowList, E> {
                Ok(std::iter::once(v.to_string()).collect())
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<AllowList, E> {
                Ok(std::iter::once(v.to_string()).collect())
            }

            fn visit_unit<E: de::Error>(self) -> Result<AllowList, E> {
                Ok(AllowList::all())
            }

            fn visit_none<E: de::Error>(self) -> Result<AllowList, E> {
                Ok(AllowList::all())
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<AllowList, A::Error> {
                let mut ids = BTreeSet::new();
                while let Some(item) = seq.next_element::<serde_json::Value>()? {
                    let id = match item {
                        serde_json::Value::String(s) => s.trim().to_string(),
                        serde_json::Value::Number(n) => n.to_string(),
                        other => {
                            return Err(de::Error::custom(format!("invalid user id: {}", other)))
                        }
                    };
                    if !id.is_empty() {
                        ids.insert(id);
                    }
                }
                Ok(AllowList(ids))
            }
        }

        deserializer.deserialize_any(AllowListVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_keys_have_fixed_format() {
        assert_eq!(session_key_for(ChatPlatform::Group, Some("123"), "456"), "qq:group:123:456");
        assert_eq!(session_key_for(ChatPlatform::Private, None, "456"), "qq:private:456");
        assert_eq!(session_key_for(ChatPlatform::Private, Some("123"), "456"), "qq:private:456");
        assert_eq!(session_key_for(ChatPlatform::Group, None, "456"), "qq:private:456");
    }

    #[test]
    fn session_keys_parse_back() {
        for key in [SessionKey::group("123", "456"), SessionKey::private("456")] {
            assert_eq!(SessionKey::parse(&key.to_string()), Some(key));
        }
        for foreign in ["agent:main", "qq:group:1", "qq:private:", "qq:group::2", "qq:private:1:2", ""] {
            assert_eq!(SessionKey::parse(foreign), None, "{}", foreign);
        }
    }

    #[test]
    fn allow_list_gate() {
        assert!(is_allowed("664275355", &AllowList::all()));
        assert!(!is_allowed("1", &AllowList::parse("664275355")));
        assert!(is_allowed("664275355", &AllowList::parse("664275355")));
    }

    #[test]
    fn allow_list_parses_comma_separated() {
        let list = AllowList::parse(" 1, 2 ,,3, ");
        assert_eq!(list.len(), 3);
        assert!(list.contains("2"));
        assert!(AllowList::parse("  ").is_unrestricted());
    }

    #[test]
    fn allow_list_deserializes_all_shapes() {
        let from_str: AllowList = serde_json::from_str(r#""1,2""#).unwrap();
        let from_list: AllowList = serde_json::from_str(r#"[1, "2"]"#).unwrap();
        let single: AllowList = serde_json::from_str("7").unwrap();
        let null: AllowList = serde_json::from_str("null").unwrap();
        assert_eq!(from_str, from_list);
        assert!(single.contains("7"));
        assert!(null.is_unrestricted());
        assert!(serde_json::from_str::<AllowList>("[true]").is_err());
    }
}
