//! In-memory chat transport.
//!
//! Stores users, channel members and message documents in process and
//! keeps an ordered log of every operation, so callers can check exactly
//! which side effects happened and in which order. Posting a message
//! fans a `message.new` event out to every connection watching the
//! channel, including the author's own.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::agent::{
    AgentUserId, ChannelIdentity, ChatEvent, ChatMessage, IndicatorEvent, MessagePatch,
    MessageUser, NewMessage, UserProfile,
};
use crate::error::Error;
use crate::Result;

use super::{ChatConnection, ChatServer, EventHub, Subscription};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    UpsertUser,
    DeleteUser,
    AddMembers,
    Connect,
    Watch,
    SendMessage,
    SendEvent,
    PatchMessage,
    Disconnect,
}

/// One recorded transport operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    UpsertUser(String),
    DeleteUser { user_id: String, hard: bool },
    AddMembers { cid: String, user_ids: Vec<String> },
    Connect(String),
    Watch { user_id: String, cid: String },
    SendMessage { user_id: String, message_id: String, ai_generated: bool },
    SendEvent { user_id: String, event: IndicatorEvent },
    PatchMessage { message_id: String, text: Option<String> },
    Disconnect(String),
}

#[derive(Default)]
struct State {
    users: HashMap<String, UserProfile>,
    members: HashMap<String, Vec<String>>,
    messages: HashMap<String, ChatMessage>,
    message_order: Vec<String>,
    watching: HashMap<String, HashSet<String>>,
    ops: Vec<Op>,
    fail: HashSet<FailPoint>,
    delays: HashMap<FailPoint, Duration>,
    next_message: u64,
}

struct Shared {
    state: Mutex<State>,
    hubs: Mutex<HashMap<String, EventHub>>,
}

/// In-process [`ChatServer`].
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                hubs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Make an operation fail until [`MemoryTransport::heal`] is called.
    pub fn fail_on(&self, point: FailPoint) {
        self.state().fail.insert(point);
    }

    pub fn heal(&self, point: FailPoint) {
        self.state().fail.remove(&point);
    }

    /// Suspend inside an operation, widening the window for interleaving.
    pub fn set_delay(&self, point: FailPoint, delay: Duration) {
        self.state().delays.insert(point, delay);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.set_delay(FailPoint::Connect, delay);
    }

    /// End a user's event stream the way a dropped socket does.
    pub fn drop_connection(&self, user_id: &str) {
        self.hub(user_id).close();
    }

    /// Post a message as a human user and notify watchers.
    pub fn post_user_message(&self, channel: &ChannelIdentity, user_id: &str, text: &str) -> ChatMessage {
        self.store_message(channel, user_id, text.to_string(), false, false)
    }

    /// Every recorded operation, oldest first.
    pub fn ops(&self) -> Vec<Op> {
        self.state().ops.clone()
    }

    pub fn message(&self, message_id: &str) -> Option<ChatMessage> {
        self.state().messages.get(message_id).cloned()
    }

    /// Messages in a channel, oldest first.
    pub fn channel_messages(&self, channel: &ChannelIdentity) -> Vec<ChatMessage> {
        let cid = channel.cid();
        let state = self.state();
        state
            .message_order
            .iter()
            .filter_map(|id| state.messages.get(id))
            .filter(|m| m.cid == cid)
            .cloned()
            .collect()
    }

    /// Indicator events emitted for one message, in order.
    pub fn indicator_events(&self, message_id: &str) -> Vec<IndicatorEvent> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::SendEvent { event, .. } if event.message_id == message_id => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.state().users.contains_key(user_id)
    }

    pub fn members(&self, channel: &ChannelIdentity) -> Vec<String> {
        self.state().members.get(&channel.cid()).cloned().unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // poisoning only happens if a test panicked while holding the lock
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pause(&self, point: FailPoint) {
        let delay = self.state().delays.get(&point).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        if self.state().fail.contains(&point) {
            return Err(Error::Transport(format!("{point:?} failed")));
        }
        Ok(())
    }

    fn record(&self, op: Op) {
        self.state().ops.push(op);
    }

    fn hub(&self, user_id: &str) -> EventHub {
        let mut hubs = self.shared.hubs.lock().unwrap_or_else(|e| e.into_inner());
        hubs.entry(user_id.to_string()).or_default().clone()
    }

    fn store_message(
        &self,
        channel: &ChannelIdentity,
        user_id: &str,
        text: String,
        ai_generated: bool,
        log: bool,
    ) -> ChatMessage {
        let cid = channel.cid();
        let (message, watchers) = {
            let mut state = self.state();
            state.next_message += 1;
            let message = ChatMessage {
                id: format!("msg-{}-{}", state.next_message, uuid::Uuid::new_v4().simple()),
                cid: cid.clone(),
                text: Some(text),
                ai_generated,
                user: Some(MessageUser {
                    id: user_id.to_string(),
                }),
            };
            state.messages.insert(message.id.clone(), message.clone());
            state.message_order.push(message.id.clone());
            // logged before fan-out so the send precedes any reaction to it
            if log {
                state.ops.push(Op::SendMessage {
                    user_id: user_id.to_string(),
                    message_id: message.id.clone(),
                    ai_generated,
                });
            }
            let watchers: Vec<String> = state
                .watching
                .iter()
                .filter(|(_, cids)| cids.contains(&cid))
                .map(|(user, _)| user.clone())
                .collect();
            (message, watchers)
        };

        let event = ChatEvent::message_new(message.clone());
        for watcher in watchers {
            self.hub(&watcher).publish(&event);
        }
        message
    }
}

#[async_trait]
impl ChatServer for MemoryTransport {
    async fn upsert_user(&self, profile: &UserProfile) -> Result<()> {
        self.check(FailPoint::UpsertUser)?;
        let mut state = self.state();
        state.users.insert(profile.id.clone(), profile.clone());
        state.ops.push(Op::UpsertUser(profile.id.clone()));
        Ok(())
    }

    async fn delete_user(&self, user_id: &str, hard: bool) -> Result<()> {
        self.pause(FailPoint::DeleteUser).await;
        self.check(FailPoint::DeleteUser)?;
        let mut state = self.state();
        state.users.remove(user_id);
        state.ops.push(Op::DeleteUser {
            user_id: user_id.to_string(),
            hard,
        });
        Ok(())
    }

    async fn add_members(&self, channel: &ChannelIdentity, user_ids: &[String]) -> Result<()> {
        self.check(FailPoint::AddMembers)?;
        let cid = channel.cid();
        let mut state = self.state();
        let members = state.members.entry(cid.clone()).or_default();
        for id in user_ids {
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        state.ops.push(Op::AddMembers {
            cid,
            user_ids: user_ids.to_vec(),
        });
        Ok(())
    }

    async fn connect_user(&self, user_id: &AgentUserId) -> Result<Arc<dyn ChatConnection>> {
        self.pause(FailPoint::Connect).await;
        self.check(FailPoint::Connect)?;
        self.record(Op::Connect(user_id.to_string()));
        debug!(user = %user_id, "memory transport: user connected");

        Ok(Arc::new(MemoryConnection {
            user_id: user_id.to_string(),
            transport: self.clone(),
        }))
    }
}

/// A user connected to a [`MemoryTransport`].
pub struct MemoryConnection {
    user_id: String,
    transport: MemoryTransport,
}

#[async_trait]
impl ChatConnection for MemoryConnection {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn watch(&self, channel: &ChannelIdentity) -> Result<()> {
        self.transport.check(FailPoint::Watch)?;
        let mut state = self.transport.state();
        state
            .watching
            .entry(self.user_id.clone())
            .or_default()
            .insert(channel.cid());
        state.ops.push(Op::Watch {
            user_id: self.user_id.clone(),
            cid: channel.cid(),
        });
        Ok(())
    }

    async fn send_message(&self, channel: &ChannelIdentity, message: &NewMessage) -> Result<ChatMessage> {
        self.transport.check(FailPoint::SendMessage)?;
        Ok(self.transport.store_message(
            channel,
            &self.user_id,
            message.text.clone(),
            message.ai_generated,
            true,
        ))
    }

    async fn send_event(&self, _channel: &ChannelIdentity, event: &IndicatorEvent) -> Result<()> {
        self.transport.check(FailPoint::SendEvent)?;
        self.transport.record(Op::SendEvent {
            user_id: self.user_id.clone(),
            event: event.clone(),
        });
        Ok(())
    }

    async fn partial_update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<()> {
        self.transport.check(FailPoint::PatchMessage)?;
        let mut state = self.transport.state();
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| Error::NotFound(format!("message {message_id}")))?;
        if let Some(text) = patch.text() {
            message.text = Some(text.to_string());
        }
        state.ops.push(Op::PatchMessage {
            message_id: message_id.to_string(),
            text: patch.text().map(str::to_string),
        });
        Ok(())
    }

    fn subscribe(&self, event_type: &str) -> Subscription {
        self.transport.hub(&self.user_id).subscribe(event_type)
    }

    async fn disconnect(&self) -> Result<()> {
        self.transport.pause(FailPoint::Disconnect).await;
        self.transport.check(FailPoint::Disconnect)?;
        self.transport.hub(&self.user_id).close();
        let mut state = self.transport.state();
        state.watching.remove(&self.user_id);
        state.ops.push(Op::Disconnect(self.user_id.clone()));
        Ok(())
    }
}
