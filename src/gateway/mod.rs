//! HTTP control surface.
//!
//! Routes:
//! - `GET /` server info
//! - `POST /token` chat token for a signed-in user
//! - `POST /start-ai-agent`, `POST /stop-ai-agent`
//! - `GET /agent-status?channel_id=..`

mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::adapters::ChatServer;
use crate::auth::{IdentityProvider, TokenSigner};
use crate::registry::AgentRegistry;
use crate::Result;

pub use routes::{AgentRequest, ErrorBody, StatusQuery};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub server: Arc<dyn ChatServer>,
    pub identity: Arc<dyn IdentityProvider>,
    pub signer: Arc<TokenSigner>,
    pub api_key: String,
    pub default_channel_type: String,
}

/// Build the router with permissive CORS and request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::info))
        .route("/token", post(routes::token))
        .route("/start-ai-agent", post(routes::start_agent))
        .route("/stop-ai-agent", post(routes::stop_agent))
        .route("/agent-status", get(routes::agent_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
