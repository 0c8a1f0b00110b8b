//! Adapters module: chat transport integrations.
//!
//! The agent core talks to the chat service through two traits:
//!
//! - [`ChatServer`]: server-credentialed administration (users, members)
//!   and connecting an agent user
//! - [`ChatConnection`]: one connected user: watch a channel, post and
//!   patch messages, emit custom events, subscribe to events
//!
//! # Implementations
//!
//! - **Stream Chat**: REST + WebSocket client ([`stream_chat`])
//! - **Memory**: in-process store with an ordered operation log, built for
//!   tests and behind the `test-util` feature (`memory`)

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod stream_chat;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::agent::{
    AgentUserId, ChannelIdentity, ChatEvent, ChatMessage, IndicatorEvent, MessagePatch,
    NewMessage, UserProfile,
};
use crate::Result;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryTransport;
pub use stream_chat::StreamChatServer;

/// Server-side chat client.
#[async_trait]
pub trait ChatServer: Send + Sync {
    /// Create or update a user.
    async fn upsert_user(&self, profile: &UserProfile) -> Result<()>;

    /// Delete a user; `hard` removes it permanently.
    async fn delete_user(&self, user_id: &str, hard: bool) -> Result<()>;

    /// Add users to a channel's member list.
    async fn add_members(&self, channel: &ChannelIdentity, user_ids: &[String]) -> Result<()>;

    /// Connect as the given user.
    async fn connect_user(&self, user_id: &AgentUserId) -> Result<Arc<dyn ChatConnection>>;
}

/// A connected chat user.
///
/// All implementations must be [`Send`] + [`Sync`]; one connection is
/// shared by an agent and every response it is streaming.
#[async_trait]
pub trait ChatConnection: Send + Sync {
    /// Id of the connected user.
    fn user_id(&self) -> &str;

    /// Start receiving events for a channel.
    async fn watch(&self, channel: &ChannelIdentity) -> Result<()>;

    /// Post a message; returns the stored message with its id.
    async fn send_message(&self, channel: &ChannelIdentity, message: &NewMessage) -> Result<ChatMessage>;

    /// Emit a custom event on a channel.
    async fn send_event(&self, channel: &ChannelIdentity, event: &IndicatorEvent) -> Result<()>;

    /// Overwrite fields of a stored message.
    async fn partial_update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<()>;

    /// Receive events of one type until unsubscribed.
    fn subscribe(&self, event_type: &str) -> Subscription;

    /// Close the connection; subscriptions stop receiving.
    async fn disconnect(&self) -> Result<()>;
}

/// Events for one subscription plus the handle that ends it.
pub struct Subscription {
    pub events: mpsc::UnboundedReceiver<ChatEvent>,
    pub handle: Unsubscribe,
}

/// Cancellation handle returned by [`ChatConnection::subscribe`].
///
/// Cancelling twice is harmless; dropping cancels.
pub struct Unsubscribe {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Subscriber {
    id: u64,
    event_type: String,
    tx: mpsc::UnboundedSender<ChatEvent>,
}

/// Fan-out of incoming events to subscribers.
#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event_type: &str) -> Subscription {
        let (tx, events) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Subscriber {
                id,
                event_type: event_type.to_string(),
                tx,
            });
        }

        let subscribers = Arc::clone(&self.subscribers);
        let handle = Unsubscribe::new(move || {
            if let Ok(mut subscribers) = subscribers.lock() {
                subscribers.retain(|s| s.id != id);
            }
        });

        Subscription { events, handle }
    }

    /// Deliver an event to matching subscribers; returns how many received it.
    pub fn publish(&self, event: &ChatEvent) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers
            .iter()
            .filter(|s| s.event_type == event.event_type)
            .filter(|s| s.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Drop every subscriber.
    pub fn close(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EVENT_MESSAGE_NEW;

    fn event(kind: &str) -> ChatEvent {
        ChatEvent {
            event_type: kind.to_string(),
            cid: None,
            message: None,
        }
    }

    #[tokio::test]
    async fn test_hub_delivers_by_type() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe(EVENT_MESSAGE_NEW);

        assert_eq!(hub.publish(&event("typing.start")), 0);
        assert_eq!(hub.publish(&event(EVENT_MESSAGE_NEW)), 1);

        let received = sub.events.recv().await.unwrap();
        assert_eq!(received.event_type, EVENT_MESSAGE_NEW);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe(EVENT_MESSAGE_NEW);
        assert_eq!(hub.subscriber_count(), 1);

        sub.handle.cancel();
        sub.handle.cancel();
        assert!(!sub.handle.is_active());
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(&event(EVENT_MESSAGE_NEW)), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = EventHub::new();
        {
            let _sub = hub.subscribe(EVENT_MESSAGE_NEW);
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }
}
