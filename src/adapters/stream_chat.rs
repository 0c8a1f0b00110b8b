//! Stream Chat adapter: REST for writes, WebSocket for events.
//!
//! Server-side calls authenticate with a server token; each agent user
//! connects with its own user token and receives channel events over a
//! socket that stays open until [`ChatConnection::disconnect`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::{
    AgentUserId, ChannelIdentity, ChatEvent, ChatMessage, IndicatorEvent, MessagePatch,
    NewMessage, UserProfile,
};
use crate::auth::TokenSigner;
use crate::config::Config;
use crate::error::Error;
use crate::Result;

use super::{ChatConnection, ChatServer, EventHub, Subscription};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(25);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Shared REST plumbing.
struct StreamApi {
    api_key: String,
    api_url: String,
    ws_url: String,
    signer: TokenSigner,
    http: Client,
}

impl StreamApi {
    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| Error::Config(format!("invalid Stream API URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config("Stream API URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("api_key", &self.api_key);
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn call(&self, method: Method, url: Url, token: &str, body: Option<&Value>) -> Result<Value> {
        debug!(%method, path = url.path(), "Stream API call");
        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", token)
            .header("stream-auth-type", "jwt");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("Stream API error ({status}): {text}")));
        }
        Ok(response.json().await?)
    }

    async fn server_call(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value> {
        let token = self.signer.server_token()?;
        self.call(method, url, &token, body).await
    }
}

/// Server-credentialed Stream Chat client.
#[derive(Clone)]
pub struct StreamChatServer {
    api: Arc<StreamApi>,
}

impl StreamChatServer {
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.stream_api_key.is_empty() {
            return Err(Error::Config("Stream API key is required".to_string()));
        }
        Ok(Self {
            api: Arc::new(StreamApi {
                api_key: config.stream_api_key.clone(),
                api_url: config.stream_api_url.clone(),
                ws_url: config.stream_ws_url.clone(),
                signer: TokenSigner::new(&config.stream_api_secret)?,
                http: Client::new(),
            }),
        })
    }
}

#[async_trait]
impl ChatServer for StreamChatServer {
    async fn upsert_user(&self, profile: &UserProfile) -> Result<()> {
        let url = self.api.endpoint(&["users"], &[])?;
        let body = json!({ "users": { profile.id.as_str(): profile } });
        self.api.server_call(Method::POST, url, Some(&body)).await?;
        Ok(())
    }

    async fn delete_user(&self, user_id: &str, hard: bool) -> Result<()> {
        let hard = if hard { "true" } else { "false" };
        let url = self.api.endpoint(
            &["users", user_id],
            &[("hard_delete", hard), ("mark_messages_deleted", "false")],
        )?;
        self.api.server_call(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn add_members(&self, channel: &ChannelIdentity, user_ids: &[String]) -> Result<()> {
        let url = self
            .api
            .endpoint(&["channels", &channel.channel_type, &channel.channel_id], &[])?;
        let body = json!({ "add_members": user_ids });
        self.api.server_call(Method::POST, url, Some(&body)).await?;
        Ok(())
    }

    async fn connect_user(&self, user_id: &AgentUserId) -> Result<Arc<dyn ChatConnection>> {
        let connection = StreamChatConnection::connect(Arc::clone(&self.api), user_id.as_str()).await?;
        Ok(Arc::new(connection))
    }
}

/// One user's socket plus its REST token.
pub struct StreamChatConnection {
    api: Arc<StreamApi>,
    user_id: String,
    token: String,
    connection_id: String,
    hub: EventHub,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamChatConnection {
    async fn connect(api: Arc<StreamApi>, user_id: &str) -> Result<Self> {
        let token = api.signer.user_token(user_id)?;

        let mut url = Url::parse(&api.ws_url)
            .map_err(|e| Error::Config(format!("invalid Stream WebSocket URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config("Stream WebSocket URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push("connect");
        let payload = json!({
            "user_id": user_id,
            "user_details": { "id": user_id },
            "server_determines_connection_id": true,
        });
        url.query_pairs_mut()
            .append_pair("json", &payload.to_string())
            .append_pair("api_key", &api.api_key)
            .append_pair("authorization", &token)
            .append_pair("stream-auth-type", "jwt");

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (sink, mut stream) = socket.split();

        let connection_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(frame) = stream.next().await {
                let WsMessage::Text(text) = frame? else {
                    continue;
                };
                let value: Value = serde_json::from_str(&text)?;
                if let Some(err) = value.get("error") {
                    return Err(Error::Transport(format!("Stream connect rejected: {err}")));
                }
                if let Some(id) = value.get("connection_id").and_then(Value::as_str) {
                    return Ok(id.to_string());
                }
            }
            Err::<String, Error>(Error::Transport("socket closed before handshake".to_string()))
        })
        .await
        .map_err(|_| Error::Transport("timed out waiting for Stream handshake".to_string()))??;

        info!(user = %user_id, connection = %connection_id, "Connected to Stream Chat");

        let hub = EventHub::new();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));

        let reader_hub = hub.clone();
        let reader_user = user_id.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ChatEvent>(&text) {
                        Ok(event) => {
                            reader_hub.publish(&event);
                        }
                        Err(e) => debug!(user = %reader_user, "Skipping undecodable frame: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(user = %reader_user, "Stream socket error: {}", e);
                        break;
                    }
                }
            }
            reader_hub.close();
        });

        let heartbeat_sink = Arc::clone(&sink);
        let client_id = connection_id.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = json!([{ "type": "health.check", "client_id": client_id }]).to_string();
                if heartbeat_sink.lock().await.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            api,
            user_id: user_id.to_string(),
            token,
            connection_id,
            hub,
            sink,
            tasks: Mutex::new(vec![reader, heartbeat]),
        })
    }

    fn channel_endpoint(&self, channel: &ChannelIdentity, action: &str, query: &[(&str, &str)]) -> Result<Url> {
        self.api.endpoint(
            &["channels", &channel.channel_type, &channel.channel_id, action],
            query,
        )
    }
}

#[async_trait]
impl ChatConnection for StreamChatConnection {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn watch(&self, channel: &ChannelIdentity) -> Result<()> {
        let url = self.channel_endpoint(channel, "query", &[("connection_id", self.connection_id.as_str())])?;
        let body = json!({ "state": true, "watch": true, "presence": false });
        self.api.call(Method::POST, url, &self.token, Some(&body)).await?;
        Ok(())
    }

    async fn send_message(&self, channel: &ChannelIdentity, message: &NewMessage) -> Result<ChatMessage> {
        let url = self.channel_endpoint(channel, "message", &[])?;
        let body = json!({ "message": message });
        let mut response = self.api.call(Method::POST, url, &self.token, Some(&body)).await?;
        let stored = response
            .get_mut("message")
            .map(Value::take)
            .ok_or_else(|| Error::Transport("send message response without message".to_string()))?;
        Ok(serde_json::from_value(stored)?)
    }

    async fn send_event(&self, channel: &ChannelIdentity, event: &IndicatorEvent) -> Result<()> {
        let url = self.channel_endpoint(channel, "event", &[])?;
        let body = json!({ "event": event.to_payload() });
        self.api.call(Method::POST, url, &self.token, Some(&body)).await?;
        Ok(())
    }

    async fn partial_update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<()> {
        let url = self.api.endpoint(&["messages", message_id], &[])?;
        let body = serde_json::to_value(patch)?;
        self.api.call(Method::PUT, url, &self.token, Some(&body)).await?;
        Ok(())
    }

    fn subscribe(&self, event_type: &str) -> Subscription {
        self.hub.subscribe(event_type)
    }

    async fn disconnect(&self) -> Result<()> {
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in &tasks {
            task.abort();
        }
        self.hub.close();

        let closed = self.sink.lock().await.send(WsMessage::Close(None)).await;
        info!(user = %self.user_id, "Disconnected from Stream Chat");
        closed.map_err(Error::from)
    }
}

impl Drop for StreamChatConnection {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
