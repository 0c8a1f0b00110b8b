//! Agent module: one model-backed participant per chat channel.
//!
//! This module contains:
//! - Channel identity and agent user id derivation
//! - Message and indicator types (ChatMessage, IndicatorEvent, ...)
//! - Model client trait and implementations
//! - The streaming response driver
//! - [`Agent`]: subscribes to a channel and answers human messages
//!
//! Providers are plugged in through [`llm::ProviderRegistry`].

mod driver;
mod identity;
mod message;
mod prompt;

// Model providers in submodule
pub mod llm;

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{ChatConnection, Subscription, Unsubscribe};
use crate::error::Error;
use crate::Result;

// Re-exports for convenience
pub use driver::{ResponseDriver, ResponseOutcome, ERROR_TEXT};
pub use identity::{AgentUserId, ChannelIdentity, AGENT_USER_PREFIX};
pub use llm::{ChunkStream, GeminiClient, ModelClient, ModelFactory, PromptRequest, ProviderRegistry};
pub use message::{
    ChatEvent, ChatMessage, IndicatorEvent, IndicatorState, MessagePatch, MessageUser, NewMessage,
    UserProfile, EVENT_INDICATOR_CLEAR, EVENT_INDICATOR_UPDATE, EVENT_MESSAGE_NEW,
};
pub use prompt::PromptBuilder;

/// Lifecycle of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    Active,
    /// The transport ended the event stream; nothing more will arrive.
    Closed,
    Disposed,
}

/// A channel's agent: one connected chat user bound to one model client.
///
/// Responses already in flight when the agent is disposed run to
/// completion and may still patch their message; they address the
/// message document directly, not through the agent's subscription.
pub struct Agent {
    identity: ChannelIdentity,
    user_id: AgentUserId,
    connection: Arc<dyn ChatConnection>,
    model: Arc<dyn ModelClient>,
    prompt: PromptBuilder,
    last_interaction: Mutex<DateTime<Utc>>,
    state: Mutex<AgentState>,
    subscription: Mutex<Option<Unsubscribe>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(
        identity: ChannelIdentity,
        connection: Arc<dyn ChatConnection>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        Self {
            user_id: identity.agent_user_id(),
            identity,
            connection,
            model,
            prompt: PromptBuilder::new(),
            last_interaction: Mutex::new(Utc::now()),
            state: Mutex::new(AgentState::Uninitialized),
            subscription: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    pub fn with_prompt(mut self, prompt: PromptBuilder) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub fn user_id(&self) -> &AgentUserId {
        &self.user_id
    }

    pub fn state(&self) -> AgentState {
        *lock(&self.state)
    }

    /// Whether the event stream ended without the agent being disposed.
    pub fn is_closed(&self) -> bool {
        self.state() == AgentState::Closed
    }

    fn mark_closed(&self) {
        let mut state = lock(&self.state);
        if *state == AgentState::Active {
            *state = AgentState::Closed;
            warn!(agent = %self.user_id, "Event stream ended; agent no longer receives messages");
        }
    }

    /// When the last inbound message was processed (construction time until then).
    pub fn last_interaction(&self) -> DateTime<Utc> {
        *lock(&self.last_interaction)
    }

    pub(crate) fn touch(&self, at: DateTime<Utc>) {
        *lock(&self.last_interaction) = at;
    }

    /// Subscribe to new messages on the bound channel.
    ///
    /// A second call while subscribed does nothing.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        let mut state = lock(&self.state);
        if *state == AgentState::Disposed {
            return Err(Error::Other(format!("agent {} is disposed", self.user_id)));
        }

        let mut slot = lock(&self.subscription);
        if slot.is_some() {
            debug!(agent = %self.user_id, "Already subscribed");
            return Ok(());
        }

        let Subscription { mut events, handle } = self.connection.subscribe(EVENT_MESSAGE_NEW);
        let weak: Weak<Agent> = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(agent) = weak.upgrade() else {
                    return;
                };
                // each message gets its own response; they may interleave
                tokio::spawn(async move {
                    agent.handle_event(event).await;
                });
            }
            if let Some(agent) = weak.upgrade() {
                agent.mark_closed();
            }
        });

        *slot = Some(handle);
        *lock(&self.listener) = Some(listener);
        *state = AgentState::Active;
        info!(agent = %self.user_id, channel = %self.identity, "Agent initialized");
        Ok(())
    }

    /// Process one inbound event; `None` when the event is skipped.
    pub async fn handle_event(&self, event: ChatEvent) -> Option<ResponseOutcome> {
        if self.state() != AgentState::Active {
            return None;
        }
        if event.event_type != EVENT_MESSAGE_NEW {
            return None;
        }
        if let Some(ref cid) = event.cid {
            if *cid != self.identity.cid() {
                return None;
            }
        }

        let message = event.message?;
        if message.ai_generated {
            debug!(agent = %self.user_id, message = %message.id, "Skipping agent-generated message");
            return None;
        }
        let text = message.prompt_text()?;

        // before streaming, so a long response is not mistaken for idleness
        self.touch(Utc::now());

        let request = PromptRequest::new(text).with_system(self.prompt.build());
        let driver = ResponseDriver::new(self.connection.as_ref(), &self.identity, self.model.as_ref());
        match driver.respond(&request).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(agent = %self.user_id, "Failed to start response: {}", e);
                None
            }
        }
    }

    /// Unsubscribe and release the connection. Later calls do nothing.
    pub async fn dispose(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state == AgentState::Disposed {
                return Ok(());
            }
            *state = AgentState::Disposed;
        }

        if let Some(mut handle) = lock(&self.subscription).take() {
            handle.cancel();
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }

        info!(agent = %self.user_id, "Agent disposed");
        self.connection.disconnect().await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{FailPoint, Op};
    use crate::adapters::{ChatServer, MemoryTransport};
    use crate::agent::llm::FakeModelClient;
    use std::time::Duration;

    fn channel() -> ChannelIdentity {
        ChannelIdentity::new("messaging", "essay")
    }

    async fn agent_with(
        transport: &MemoryTransport,
        model: Arc<FakeModelClient>,
    ) -> Arc<Agent> {
        let conn = transport
            .connect_user(&channel().agent_user_id())
            .await
            .unwrap();
        conn.watch(&channel()).await.unwrap();
        Arc::new(Agent::new(channel(), conn, model))
    }

    fn human(text: Option<&str>) -> ChatEvent {
        ChatEvent::message_new(ChatMessage {
            id: "human-1".to_string(),
            cid: channel().cid(),
            text: text.map(str::to_string),
            ai_generated: false,
            user: Some(MessageUser {
                id: "alice".to_string(),
            }),
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_handles_human_message() {
        let transport = MemoryTransport::new();
        let model = Arc::new(FakeModelClient::chunks(&["Tighter ", "prose."]));
        let agent = agent_with(&transport, model.clone()).await;
        agent.init().unwrap();

        let outcome = agent.handle_event(human(Some("Edit this"))).await.unwrap();
        assert!(outcome.is_done());

        let prompts = model.prompts();
        assert_eq!(prompts[0].prompt, "Edit this");
        assert!(prompts[0].system.as_deref().unwrap().contains("Writing Assistant"));
    }

    #[tokio::test]
    async fn test_skips_messages_without_text() {
        let transport = MemoryTransport::new();
        let agent = agent_with(&transport, Arc::new(FakeModelClient::chunks(&["x"]))).await;
        agent.init().unwrap();

        assert!(agent.handle_event(human(None)).await.is_none());
        assert!(agent.handle_event(human(Some(""))).await.is_none());
        assert!(transport.channel_messages(&channel()).is_empty());
    }

    #[tokio::test]
    async fn test_skips_other_channels() {
        let transport = MemoryTransport::new();
        let agent = agent_with(&transport, Arc::new(FakeModelClient::chunks(&["x"]))).await;
        agent.init().unwrap();

        let mut event = human(Some("hi"));
        event.cid = Some("messaging:elsewhere".to_string());
        assert!(agent.handle_event(event).await.is_none());
    }

    #[tokio::test]
    async fn test_own_output_produces_no_new_messages() {
        let transport = MemoryTransport::new();
        let agent = agent_with(&transport, Arc::new(FakeModelClient::chunks(&["ok"]))).await;
        agent.init().unwrap();

        // the live subscription sees a human message, then the agent's own placeholder echo
        transport.post_user_message(&channel(), "alice", "Hello");
        settle().await;

        let messages = transport.channel_messages(&channel());
        assert_eq!(messages.len(), 2, "one human message, one response");
        assert!(messages[1].ai_generated);
        assert_eq!(messages[1].text.as_deref(), Some("ok"));

        // feeding the agent's message back directly does nothing either
        let echo = ChatEvent::message_new(messages[1].clone());
        assert!(agent.handle_event(echo).await.is_none());
        settle().await;
        assert_eq!(transport.channel_messages(&channel()).len(), 2);
    }

    #[tokio::test]
    async fn test_processing_updates_last_interaction() {
        let transport = MemoryTransport::new();
        let agent = agent_with(&transport, Arc::new(FakeModelClient::chunks(&["x"]))).await;
        agent.init().unwrap();

        let earlier = Utc::now() - chrono::Duration::hours(3);
        agent.touch(earlier);
        assert_eq!(agent.last_interaction(), earlier);

        agent.handle_event(human(None)).await;
        assert_eq!(agent.last_interaction(), earlier, "skipped events do not count");

        agent.handle_event(human(Some("hi"))).await;
        assert!(agent.last_interaction() > earlier);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let transport = MemoryTransport::new();
        let agent = agent_with(&transport, Arc::new(FakeModelClient::chunks(&["reply"]))).await;
        agent.init().unwrap();
        agent.init().unwrap();

        transport.post_user_message(&channel(), "alice", "Hello");
        settle().await;

        // a duplicate subscription would have produced two responses
        assert_eq!(transport.channel_messages(&channel()).len(), 2);
    }

    #[tokio::test]
    async fn test_dispose_stops_handling() {
        let transport = MemoryTransport::new();
        let agent = agent_with(&transport, Arc::new(FakeModelClient::chunks(&["x"]))).await;
        agent.init().unwrap();

        agent.dispose().await.unwrap();
        assert_eq!(agent.state(), AgentState::Disposed);
        assert!(transport
            .ops()
            .contains(&Op::Disconnect(channel().agent_user_id().to_string())));

        assert!(agent.handle_event(human(Some("still there?"))).await.is_none());
        assert!(agent.init().is_err());

        // second dispose is a no-op, even if the transport would now fail
        transport.fail_on(FailPoint::Disconnect);
        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_connection_marks_agent_closed() {
        let transport = MemoryTransport::new();
        let agent = agent_with(&transport, Arc::new(FakeModelClient::chunks(&["x"]))).await;
        agent.init().unwrap();
        assert!(!agent.is_closed());

        transport.drop_connection(channel().agent_user_id().as_str());
        settle().await;

        assert_eq!(agent.state(), AgentState::Closed);
        assert!(agent.handle_event(human(Some("hello?"))).await.is_none());

        // a closed agent can still be disposed
        agent.dispose().await.unwrap();
        assert_eq!(agent.state(), AgentState::Disposed);
    }

    #[tokio::test]
    async fn test_uninitialized_agent_ignores_events() {
        let transport = MemoryTransport::new();
        let agent = agent_with(&transport, Arc::new(FakeModelClient::chunks(&["x"]))).await;
        assert_eq!(agent.state(), AgentState::Uninitialized);
        assert!(agent.handle_event(human(Some("hi"))).await.is_none());
    }
}
