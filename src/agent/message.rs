//! Message and event types exchanged with the chat transport

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Event type fired by the transport when a message is posted.
pub const EVENT_MESSAGE_NEW: &str = "message.new";

/// Custom event type carrying an indicator state.
pub const EVENT_INDICATOR_UPDATE: &str = "ai_indicator.update";

/// Custom event type removing the indicator.
pub const EVENT_INDICATOR_CLEAR: &str = "ai_indicator.clear";

/// A chat user profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: None,
        }
    }
}

/// Author reference embedded in a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUser {
    pub id: String,
}

/// A message stored by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,

    #[serde(default)]
    pub cid: String,

    #[serde(default)]
    pub text: Option<String>,

    /// Set on messages written by an agent
    #[serde(default)]
    pub ai_generated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<MessageUser>,
}

impl ChatMessage {
    /// Text content, if any non-empty text is present.
    pub fn prompt_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }
}

/// A message to be posted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMessage {
    pub text: String,
    pub ai_generated: bool,
}

impl NewMessage {
    /// Empty agent-authored message used as the streaming target.
    pub fn placeholder() -> Self {
        Self {
            text: String::new(),
            ai_generated: true,
        }
    }
}

/// Partial update of a stored message (`set` semantics: overwrite listed fields)
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MessagePatch {
    pub set: Map<String, Value>,
}

impl MessagePatch {
    pub fn set_text(text: impl Into<String>) -> Self {
        let mut set = Map::new();
        set.insert("text".to_string(), Value::String(text.into()));
        Self { set }
    }

    pub fn text(&self) -> Option<&str> {
        self.set.get("text").and_then(Value::as_str)
    }
}

/// An event delivered over a transport subscription
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub cid: Option<String>,

    #[serde(default)]
    pub message: Option<ChatMessage>,
}

impl ChatEvent {
    pub fn message_new(message: ChatMessage) -> Self {
        Self {
            event_type: EVENT_MESSAGE_NEW.to_string(),
            cid: Some(message.cid.clone()),
            message: Some(message),
        }
    }
}

/// Advisory status of a response being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorState {
    Thinking,
    Generating,
    Error,
    Cleared,
}

impl IndicatorState {
    pub fn event_type(self) -> &'static str {
        match self {
            IndicatorState::Cleared => EVENT_INDICATOR_CLEAR,
            _ => EVENT_INDICATOR_UPDATE,
        }
    }

    /// Wire value of `ai_state`; the clear event carries none.
    pub fn ai_state(self) -> Option<&'static str> {
        match self {
            IndicatorState::Thinking => Some("AI_STATE_THINKING"),
            IndicatorState::Generating => Some("AI_STATE_GENERATING"),
            IndicatorState::Error => Some("AI_STATE_ERROR"),
            IndicatorState::Cleared => None,
        }
    }
}

/// Indicator event attached to one outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorEvent {
    pub state: IndicatorState,
    pub cid: String,
    pub message_id: String,
}

impl IndicatorEvent {
    pub fn new(state: IndicatorState, message: &ChatMessage) -> Self {
        Self {
            state,
            cid: message.cid.clone(),
            message_id: message.id.clone(),
        }
    }

    /// Transport payload for `sendEvent`.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "type": self.state.event_type(),
            "cid": self.cid,
            "message_id": self.message_id,
        });
        if let Some(state) = self.state.ai_state() {
            payload["ai_state"] = Value::String(state.to_string());
        }
        payload
    }
}
