//! Error types for Scribe

use thiserror::Error;

/// Result type alias for Scribe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Scribe
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Reason text reported to API callers, without the category prefix.
    pub fn reason(&self) -> String {
        match self {
            Error::Config(msg)
            | Error::Transport(msg)
            | Error::Model(msg)
            | Error::Auth(msg)
            | Error::NotFound(msg)
            | Error::Other(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error came from missing or invalid configuration.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
