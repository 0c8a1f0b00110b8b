//! Channel identity and the agent user id derived from it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix shared by every agent chat user.
pub const AGENT_USER_PREFIX: &str = "ai-bot-";

/// Escape marker for bytes outside the chat user-id alphabet.
const ESCAPE: char = '_';

/// A chat channel address: `(channel_type, channel_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub channel_type: String,
    pub channel_id: String,
}

impl ChannelIdentity {
    pub fn new(channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Transport-level channel id, `type:id`.
    pub fn cid(&self) -> String {
        format!("{}:{}", self.channel_type, self.channel_id)
    }

    /// The chat user that acts as this channel's agent.
    pub fn agent_user_id(&self) -> AgentUserId {
        AgentUserId::for_channel(&self.channel_id)
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.channel_id)
    }
}

/// Chat user id of a channel's agent.
///
/// Derived from the channel id alone so it can be recomputed by any
/// entry point without a lookup. Characters outside `[A-Za-z0-9@-]`
/// are written as `_xx` (hex of each UTF-8 byte); `_` itself is always
/// escaped, which keeps the mapping injective: `room!` becomes
/// `ai-bot-room_21` while `room` stays `ai-bot-room`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentUserId(String);

impl AgentUserId {
    pub fn for_channel(channel_id: &str) -> Self {
        let mut id = String::with_capacity(AGENT_USER_PREFIX.len() + channel_id.len());
        id.push_str(AGENT_USER_PREFIX);
        for ch in channel_id.chars() {
            if ch.is_ascii_alphanumeric() || ch == '@' || ch == '-' {
                id.push(ch);
            } else {
                let mut buf = [0u8; 4];
                for byte in ch.encode_utf8(&mut buf).bytes() {
                    id.push(ESCAPE);
                    id.push_str(&format!("{byte:02x}"));
                }
            }
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentUserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_channel_id() {
        let id = AgentUserId::for_channel("general-42");
        assert_eq!(id.as_str(), "ai-bot-general-42");
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = ChannelIdentity::new("messaging", "room!").agent_user_id();
        let b = ChannelIdentity::new("messaging", "room!").agent_user_id();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sanitized_char_does_not_collide() {
        let bang = AgentUserId::for_channel("room!");
        let plain = AgentUserId::for_channel("room");
        assert_ne!(bang, plain);
        assert_eq!(bang.as_str(), "ai-bot-room_21");
    }

    #[test]
    fn test_escape_char_cannot_forge_an_escape() {
        // literal "_21" must not collide with an escaped "!"
        let forged = AgentUserId::for_channel("room_21");
        let bang = AgentUserId::for_channel("room!");
        assert_ne!(forged, bang);
        assert_eq!(forged.as_str(), "ai-bot-room_5f21");
    }

    #[test]
    fn test_non_ascii_is_escaped_per_byte() {
        let id = AgentUserId::for_channel("é");
        assert_eq!(id.as_str(), "ai-bot-_c3_a9");
    }

    #[test]
    fn test_channel_type_does_not_affect_user_id() {
        let a = ChannelIdentity::new("messaging", "x").agent_user_id();
        let b = ChannelIdentity::new("team", "x").agent_user_id();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cid() {
        let ch = ChannelIdentity::new("messaging", "abc");
        assert_eq!(ch.cid(), "messaging:abc");
    }
}
