use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::agent::ChannelIdentity;
use crate::auth::bearer_token;
use crate::error::Error;

use super::AppState;

/// Body of the start/stop routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentRequest {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub channel_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn fail(status: StatusCode, error: &str, reason: Option<String>) -> Response {
    let body = ErrorBody {
        error: error.to_string(),
        reason,
    };
    (status, Json(body)).into_response()
}

impl AgentRequest {
    fn channel(&self, default_type: &str) -> Option<ChannelIdentity> {
        let channel_id = self.channel_id.as_deref().filter(|id| !id.is_empty())?;
        let channel_type = self
            .channel_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(default_type);
        Some(ChannelIdentity::new(channel_type, channel_id))
    }
}

pub(super) async fn info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": "AI Writing Assistant Server is running",
        "apiKey": state.api_key,
        "activeAgents": state.registry.active_count(),
    }))
}

pub(super) async fn token(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let Some(bearer) = bearer else {
        return fail(StatusCode::UNAUTHORIZED, "Unauthenticated", None);
    };

    let profile = match state.identity.authenticate(bearer).await {
        Ok(profile) => profile,
        Err(Error::NotFound(_)) => {
            return fail(StatusCode::NOT_FOUND, "Clerk user not found", None);
        }
        Err(e @ Error::Auth(_)) => {
            warn!("Rejected token request: {}", e);
            return fail(StatusCode::UNAUTHORIZED, "Unauthenticated", None);
        }
        Err(e) => {
            error!("Error generating Stream token: {}", e);
            return fail(StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate token", None);
        }
    };

    let issued = async {
        state.server.upsert_user(&profile).await?;
        state.signer.user_token(&profile.id)
    };
    match issued.await {
        Ok(token) => Json(json!({ "token": token })).into_response(),
        Err(e) => {
            error!(user = %profile.id, "Error generating Stream token: {}", e);
            fail(StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate token", None)
        }
    }
}

pub(super) async fn start_agent(
    State(state): State<AppState>,
    Json(request): Json<AgentRequest>,
) -> Response {
    info!("/start-ai-agent called for channel: {:?}", request.channel_id);
    let Some(channel) = request.channel(&state.default_channel_type) else {
        return fail(StatusCode::BAD_REQUEST, "Missing required fields", None);
    };

    match state.registry.start(&channel).await {
        Ok(_) => Json(json!({ "message": "AI Agent started", "data": [] })).into_response(),
        Err(e) => {
            error!(channel = %channel, "Failed to start AI Agent: {}", e);
            fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to start AI Agent",
                Some(e.reason()),
            )
        }
    }
}

pub(super) async fn stop_agent(
    State(state): State<AppState>,
    Json(request): Json<AgentRequest>,
) -> Response {
    info!("/stop-ai-agent called for channel: {:?}", request.channel_id);
    let Some(channel) = request.channel(&state.default_channel_type) else {
        return fail(StatusCode::BAD_REQUEST, "Missing required fields", None);
    };

    match state.registry.stop(&channel).await {
        Ok(()) => Json(json!({ "message": "AI Agent stopped", "data": [] })).into_response(),
        Err(e) => {
            error!(channel = %channel, "Failed to stop AI Agent: {}", e);
            fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to stop AI Agent",
                Some(e.reason()),
            )
        }
    }
}

pub(super) async fn agent_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let Some(channel_id) = query.channel_id.filter(|id| !id.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing channel_id", None);
    };

    // agent ids ignore the channel type
    let channel = ChannelIdentity::new(state.default_channel_type.as_str(), channel_id);
    let status = state.registry.status(&channel);
    info!(channel = %channel, agent = %channel.agent_user_id(), "/agent-status: {:?}", status);
    Json(json!({ "status": status })).into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::adapters::memory::FailPoint;
    use crate::adapters::MemoryTransport;
    use crate::agent::llm::FakeModelClient;
    use crate::agent::{ModelClient, ModelFactory, UserProfile};
    use crate::auth::{StaticIdentity, TokenSigner};
    use crate::gateway::router;
    use crate::registry::{AgentRegistry, RegistrySettings};
    use crate::Result;

    struct Harness {
        transport: MemoryTransport,
        state: AppState,
    }

    fn harness_with(models: ModelFactory) -> Harness {
        let transport = MemoryTransport::new();
        let server = Arc::new(transport.clone());
        let registry = Arc::new(AgentRegistry::new(
            server.clone(),
            models,
            RegistrySettings::default(),
        ));
        let mut users = HashMap::new();
        users.insert(
            "session-ada".to_string(),
            UserProfile::new("user_ada", "Ada"),
        );

        Harness {
            transport,
            state: AppState {
                registry,
                server,
                identity: Arc::new(StaticIdentity { users }),
                signer: Arc::new(TokenSigner::new("secret").unwrap()),
                api_key: "public-key".to_string(),
                default_channel_type: "messaging".to_string(),
            },
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(|| -> Result<Arc<dyn ModelClient>> {
            Ok(Arc::new(FakeModelClient::chunks(&["ok"])))
        }))
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_info_reports_active_agents() {
        let h = harness();
        let (status, body) = send(&h.state, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["apiKey"], "public-key");
        assert_eq!(body["activeAgents"], 0);

        send(&h.state, post("/start-ai-agent", json!({"channel_id": "novel"}))).await;
        let (_, body) = send(&h.state, get("/")).await;
        assert_eq!(body["activeAgents"], 1);
    }

    #[tokio::test]
    async fn test_start_then_status() {
        let h = harness();
        let (status, body) = send(&h.state, post("/start-ai-agent", json!({"channel_id": "novel"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "AI Agent started", "data": []}));

        let (status, body) = send(&h.state, get("/agent-status?channel_id=novel")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "connected");

        // a repeated start reports success without a second connection
        let (status, _) = send(&h.state, post("/start-ai-agent", json!({"channel_id": "novel"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.state.registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_start_requires_channel_id() {
        let h = harness();
        let (status, body) = send(&h.state, post("/start-ai-agent", json!({"channel_type": "team"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields");
    }

    #[tokio::test]
    async fn test_start_failure_reports_reason() {
        let h = harness_with(Arc::new(|| -> Result<Arc<dyn ModelClient>> {
            Err(Error::Config("Google Gemini API key is required".to_string()))
        }));
        let (status, body) = send(&h.state, post("/start-ai-agent", json!({"channel_id": "novel"}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to start AI Agent");
        assert_eq!(body["reason"], "Google Gemini API key is required");

        let (_, body) = send(&h.state, get("/agent-status?channel_id=novel")).await;
        assert_eq!(body["status"], "disconnected");
    }

    #[tokio::test]
    async fn test_stop_and_unknown_stop() {
        let h = harness();
        send(&h.state, post("/start-ai-agent", json!({"channel_id": "novel"}))).await;

        let (status, body) = send(&h.state, post("/stop-ai-agent", json!({"channel_id": "novel"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "AI Agent stopped", "data": []}));

        let (_, body) = send(&h.state, get("/agent-status?channel_id=novel")).await;
        assert_eq!(body["status"], "disconnected");

        let (status, _) = send(&h.state, post("/stop-ai-agent", json!({"channel_id": "never"}))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stop_failure_reports_reason() {
        let h = harness();
        send(&h.state, post("/start-ai-agent", json!({"channel_id": "novel"}))).await;
        h.transport.fail_on(FailPoint::Disconnect);

        let (status, body) = send(&h.state, post("/stop-ai-agent", json!({"channel_id": "novel"}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to stop AI Agent");
        assert_eq!(body["reason"], "Disconnect failed");
    }

    #[tokio::test]
    async fn test_status_requires_channel_id() {
        let h = harness();
        let (status, body) = send(&h.state, get("/agent-status")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing channel_id");
    }

    #[tokio::test]
    async fn test_status_connecting_during_start() {
        let h = harness();
        h.transport.set_connect_delay(Duration::from_millis(50));

        let starter = {
            let state = h.state.clone();
            tokio::spawn(async move {
                send(&state, post("/start-ai-agent", json!({"channel_id": "novel"}))).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (_, body) = send(&h.state, get("/agent-status?channel_id=novel")).await;
        assert_eq!(body["status"], "connecting");
        assert_eq!(starter.await.unwrap().0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_for_signed_in_user() {
        let h = harness();
        let request = Request::builder()
            .method("POST")
            .uri("/token")
            .header(header::AUTHORIZATION, "Bearer session-ada")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&h.state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["token"].as_str().unwrap().is_empty());
        assert!(h.transport.has_user("user_ada"));
    }

    #[tokio::test]
    async fn test_token_rejects_unknown_session() {
        let h = harness();
        let missing = Request::builder()
            .method("POST")
            .uri("/token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.state, missing).await.0, StatusCode::UNAUTHORIZED);

        let bogus = Request::builder()
            .method("POST")
            .uri("/token")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.state, bogus).await.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_upsert_failure_is_500() {
        let h = harness();
        h.transport.fail_on(FailPoint::UpsertUser);
        let request = Request::builder()
            .method("POST")
            .uri("/token")
            .header(header::AUTHORIZATION, "Bearer session-ada")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&h.state, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to generate token");
    }
}
