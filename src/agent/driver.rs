//! Streaming response driver.
//!
//! Turns one model chunk stream into one outbound message: a placeholder
//! is posted first, then every chunk rewrites the message with the full
//! text accumulated so far, while indicator events report progress.
//!
//! Side effects per response, in order:
//!
//! ```text
//! send placeholder -> THINKING -> GENERATING -> patch* -> CLEARED
//!                        \            \           \
//!                         +------------+-----------+--> ERROR -> error text patch
//! ```

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::adapters::ChatConnection;
use crate::Result;

use super::identity::ChannelIdentity;
use super::llm::{ModelClient, PromptRequest};
use super::message::{ChatMessage, IndicatorEvent, IndicatorState, MessagePatch, NewMessage};

/// Text left in the message when a response fails.
pub const ERROR_TEXT: &str = "Sorry, an error occurred while generating the response.";

/// How a response ended. The message is in a terminal state either way.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Done { message_id: String, text: String },
    Errored { message_id: String, reason: String },
}

impl ResponseOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            ResponseOutcome::Done { message_id, .. } | ResponseOutcome::Errored { message_id, .. } => {
                message_id
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ResponseOutcome::Done { .. })
    }
}

/// Last indicator reached before a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Placeholder,
    Thinking,
    Generating,
}

/// Drives one response into one channel.
pub struct ResponseDriver<'a> {
    connection: &'a dyn ChatConnection,
    channel: &'a ChannelIdentity,
    model: &'a dyn ModelClient,
}

impl<'a> ResponseDriver<'a> {
    pub fn new(
        connection: &'a dyn ChatConnection,
        channel: &'a ChannelIdentity,
        model: &'a dyn ModelClient,
    ) -> Self {
        Self {
            connection,
            channel,
            model,
        }
    }

    /// Produce one response for the request.
    ///
    /// Returns `Err` only if the placeholder could not be posted; after
    /// that every failure is rendered into the message and reported as
    /// [`ResponseOutcome::Errored`].
    pub async fn respond(&self, request: &PromptRequest) -> Result<ResponseOutcome> {
        let placeholder = self
            .connection
            .send_message(self.channel, &NewMessage::placeholder())
            .await?;
        debug!(channel = %self.channel, message = %placeholder.id, "Placeholder posted");

        let mut phase = Phase::Placeholder;
        match self.stream_into(&placeholder, request, &mut phase).await {
            Ok(text) => {
                info!(
                    channel = %self.channel,
                    message = %placeholder.id,
                    "Response complete: {} chars",
                    text.len()
                );
                Ok(ResponseOutcome::Done {
                    message_id: placeholder.id,
                    text,
                })
            }
            Err(e) => {
                error!(
                    channel = %self.channel,
                    message = %placeholder.id,
                    phase = ?phase,
                    "Error generating response: {}",
                    e
                );
                self.fail(&placeholder).await;
                Ok(ResponseOutcome::Errored {
                    message_id: placeholder.id,
                    reason: e.reason(),
                })
            }
        }
    }

    async fn stream_into(
        &self,
        message: &ChatMessage,
        request: &PromptRequest,
        phase: &mut Phase,
    ) -> Result<String> {
        self.indicate(IndicatorState::Thinking, message).await?;
        *phase = Phase::Thinking;

        let mut chunks = self.model.stream(request).await?;

        self.indicate(IndicatorState::Generating, message).await?;
        *phase = Phase::Generating;

        let mut text = String::new();
        while let Some(chunk) = chunks.next().await {
            text.push_str(&chunk?);
            self.connection
                .partial_update_message(&message.id, &MessagePatch::set_text(text.as_str()))
                .await?;
        }

        self.indicate(IndicatorState::Cleared, message).await?;
        Ok(text)
    }

    /// Best effort: leave the message showing an error rather than a live indicator.
    async fn fail(&self, message: &ChatMessage) {
        if let Err(e) = self.indicate(IndicatorState::Error, message).await {
            warn!(message = %message.id, "Failed to send error indicator: {}", e);
        }
        if let Err(e) = self
            .connection
            .partial_update_message(&message.id, &MessagePatch::set_text(ERROR_TEXT))
            .await
        {
            warn!(message = %message.id, "Failed to write error text: {}", e);
        }
    }

    async fn indicate(&self, state: IndicatorState, message: &ChatMessage) -> Result<()> {
        self.connection
            .send_event(self.channel, &IndicatorEvent::new(state, message))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{FailPoint, Op};
    use crate::adapters::{ChatServer, MemoryTransport};
    use crate::agent::identity::AgentUserId;
    use crate::agent::llm::{FakeModelClient, Script};
    use crate::error::Error;
    use std::sync::Arc;

    fn channel() -> ChannelIdentity {
        ChannelIdentity::new("messaging", "drafts")
    }

    async fn connect(transport: &MemoryTransport) -> Arc<dyn ChatConnection> {
        transport
            .connect_user(&AgentUserId::for_channel("drafts"))
            .await
            .unwrap()
    }

    fn states(transport: &MemoryTransport, message_id: &str) -> Vec<IndicatorState> {
        transport
            .indicator_events(message_id)
            .into_iter()
            .map(|e| e.state)
            .collect()
    }

    #[tokio::test]
    async fn test_final_text_is_concatenation_in_order() {
        let transport = MemoryTransport::new();
        let conn = connect(&transport).await;
        let model = FakeModelClient::chunks(&["The ", "quick ", "brown ", "fox."]);
        let ch = channel();

        let outcome = ResponseDriver::new(conn.as_ref(), &ch, &model)
            .respond(&PromptRequest::new("write"))
            .await
            .unwrap();

        assert!(outcome.is_done());
        let stored = transport.message(outcome.message_id()).unwrap();
        assert_eq!(stored.text.as_deref(), Some("The quick brown fox."));
        assert!(stored.ai_generated);
        assert_eq!(
            states(&transport, outcome.message_id()),
            vec![
                IndicatorState::Thinking,
                IndicatorState::Generating,
                IndicatorState::Cleared
            ]
        );
    }

    #[tokio::test]
    async fn test_side_effects_are_ordered() {
        let transport = MemoryTransport::new();
        let conn = connect(&transport).await;
        let model = FakeModelClient::chunks(&["a", "b"]);
        let ch = channel();

        let outcome = ResponseDriver::new(conn.as_ref(), &ch, &model)
            .respond(&PromptRequest::new("go"))
            .await
            .unwrap();
        let id = outcome.message_id().to_string();

        let ops: Vec<Op> = transport
            .ops()
            .into_iter()
            .filter(|op| !matches!(op, Op::Connect(_)))
            .collect();

        assert!(matches!(&ops[0], Op::SendMessage { message_id, ai_generated: true, .. } if *message_id == id));
        assert!(matches!(&ops[1], Op::SendEvent { event, .. } if event.state == IndicatorState::Thinking));
        assert!(matches!(&ops[2], Op::SendEvent { event, .. } if event.state == IndicatorState::Generating));
        assert_eq!(ops[3], Op::PatchMessage { message_id: id.clone(), text: Some("a".to_string()) });
        assert_eq!(ops[4], Op::PatchMessage { message_id: id.clone(), text: Some("ab".to_string()) });
        assert!(matches!(&ops[5], Op::SendEvent { event, .. } if event.state == IndicatorState::Cleared));
        assert_eq!(ops.len(), 6);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_replaces_partial_text() {
        let transport = MemoryTransport::new();
        let conn = connect(&transport).await;
        let model = FakeModelClient::new(Script::FailAfter(
            vec!["partial ".to_string(), "answer".to_string()],
            "stream reset".to_string(),
        ));
        let ch = channel();

        let outcome = ResponseDriver::new(conn.as_ref(), &ch, &model)
            .respond(&PromptRequest::new("go"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ResponseOutcome::Errored {
                message_id: outcome.message_id().to_string(),
                reason: "stream reset".to_string(),
            }
        );
        let stored = transport.message(outcome.message_id()).unwrap();
        assert_eq!(stored.text.as_deref(), Some(ERROR_TEXT));
        assert_eq!(
            states(&transport, outcome.message_id()).last(),
            Some(&IndicatorState::Error)
        );
    }

    #[tokio::test]
    async fn test_failure_to_open_stream() {
        let transport = MemoryTransport::new();
        let conn = connect(&transport).await;
        let model = FakeModelClient::new(Script::FailToOpen("quota".to_string()));
        let ch = channel();

        let outcome = ResponseDriver::new(conn.as_ref(), &ch, &model)
            .respond(&PromptRequest::new("go"))
            .await
            .unwrap();

        assert!(!outcome.is_done());
        assert_eq!(
            states(&transport, outcome.message_id()),
            vec![IndicatorState::Thinking, IndicatorState::Error]
        );
        let stored = transport.message(outcome.message_id()).unwrap();
        assert_eq!(stored.text.as_deref(), Some(ERROR_TEXT));
    }

    #[tokio::test]
    async fn test_patch_failure_still_ends_in_error_state() {
        let transport = MemoryTransport::new();
        let conn = connect(&transport).await;
        let model = FakeModelClient::chunks(&["x"]);
        let ch = channel();

        transport.fail_on(FailPoint::PatchMessage);
        let outcome = ResponseDriver::new(conn.as_ref(), &ch, &model)
            .respond(&PromptRequest::new("go"))
            .await
            .unwrap();

        assert!(!outcome.is_done());
        assert_eq!(
            states(&transport, outcome.message_id()).last(),
            Some(&IndicatorState::Error)
        );
    }

    #[tokio::test]
    async fn test_placeholder_failure_is_returned() {
        let transport = MemoryTransport::new();
        let conn = connect(&transport).await;
        let model = FakeModelClient::chunks(&["x"]);
        let ch = channel();

        transport.fail_on(FailPoint::SendMessage);
        let err = ResponseDriver::new(conn.as_ref(), &ch, &model)
            .respond(&PromptRequest::new("go"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_empty_stream_completes_with_empty_text() {
        let transport = MemoryTransport::new();
        let conn = connect(&transport).await;
        let model = FakeModelClient::chunks(&[]);
        let ch = channel();

        let outcome = ResponseDriver::new(conn.as_ref(), &ch, &model)
            .respond(&PromptRequest::new("go"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ResponseOutcome::Done {
                message_id: outcome.message_id().to_string(),
                text: String::new(),
            }
        );
    }
}
