//! Model client abstraction layer.
//!
//! This module provides:
//! - [`ModelClient`] trait: a prompt in, a lazy stream of text chunks out
//! - [`ProviderRegistry`] for creating the configured provider
//! - Concrete implementation: Gemini (API key, SSE streaming)
//!
//! A new provider implements [`ModelClient`] in its own file, gets its
//! credentials from [`Config`], and is selected in
//! [`ProviderRegistry::create`]. Agents never hold a provider type
//! directly, only `Arc<dyn ModelClient>` from a [`ModelFactory`].

mod types;

pub mod gemini;
pub mod sse;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::Stream;

use crate::config::Config;
use crate::error::Error;
use crate::Result;

pub use gemini::GeminiClient;
pub use types::*;

/// Lazy, finite, non-restartable sequence of text chunks.
///
/// May fail on any item; the consumer stops at the first error.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A single generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    /// System instruction, if any.
    pub system: Option<String>,

    /// The user's text.
    pub prompt: String,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Model client trait: swappable provider abstraction.
///
/// Implement this trait to add a new model provider.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Open a response stream for the prompt.
    ///
    /// Errors returned here happen before any chunk is produced; errors
    /// inside the stream happen mid-generation.
    async fn stream(&self, request: &PromptRequest) -> Result<ChunkStream>;

    /// Model name requests are sent to.
    fn default_model(&self) -> &str;
}

/// Creates a model client per agent; failures are configuration errors.
pub type ModelFactory = Arc<dyn Fn() -> Result<Arc<dyn ModelClient>> + Send + Sync>;

/// Provider registry: creates model clients from configuration.
///
/// # Example
///
/// ```ignore
/// let client = ProviderRegistry::create(&config)?;
/// let mut chunks = client.stream(&PromptRequest::new("Hello")).await?;
/// ```
pub struct ProviderRegistry;

impl ProviderRegistry {
    /// Create a model client from configuration.
    pub fn create(config: &Config) -> Result<Arc<dyn ModelClient>> {
        if config.gemini_api_key.is_empty() {
            return Err(Error::Config(
                "Google Gemini API key is required (GEMINI_API_KEY)".to_string(),
            ));
        }
        Ok(Arc::new(GeminiClient::new(&config.gemini_api_key, &config.model)))
    }

    /// Factory re-reading the captured configuration on every agent construction.
    pub fn factory(config: Config) -> ModelFactory {
        Arc::new(move || Self::create(&config))
    }

    /// Providers `create` knows about.
    pub fn available() -> &'static [&'static str] {
        &["gemini"]
    }
}

/// Scripted behaviour for [`FakeModelClient`].
#[cfg(test)]
#[derive(Debug, Clone)]
pub enum Script {
    /// Yield these chunks, then finish.
    Chunks(Vec<String>),
    /// Yield these chunks, then fail.
    FailAfter(Vec<String>, String),
    /// Fail before producing a stream.
    FailToOpen(String),
}

/// Fake model client for testing.
#[cfg(test)]
pub struct FakeModelClient {
    script: Script,
    prompts: std::sync::Mutex<Vec<PromptRequest>>,
}

#[cfg(test)]
impl FakeModelClient {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Stream that yields the given chunks.
    pub fn chunks(chunks: &[&str]) -> Self {
        Self::new(Script::Chunks(chunks.iter().map(|c| c.to_string()).collect()))
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<PromptRequest> {
        self.prompts.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ModelClient for FakeModelClient {
    async fn stream(&self, request: &PromptRequest) -> Result<ChunkStream> {
        use futures_util::stream::{self, StreamExt};

        self.prompts.lock().unwrap().push(request.clone());

        let items: Vec<Result<String>> = match &self.script {
            Script::Chunks(chunks) => chunks.iter().cloned().map(Ok).collect(),
            Script::FailAfter(chunks, reason) => chunks
                .iter()
                .cloned()
                .map(Ok)
                .chain(std::iter::once(Err(Error::Model(reason.clone()))))
                .collect(),
            Script::FailToOpen(reason) => return Err(Error::Model(reason.clone())),
        };

        Ok(stream::iter(items).boxed())
    }

    fn default_model(&self) -> &str {
        "fake-model"
    }
}
