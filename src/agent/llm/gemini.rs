//! Gemini streaming client (API key authentication).

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::Error;
use crate::Result;

use super::sse::SseStream;
use super::{ChunkStream, GeminiResponse, ModelClient, PromptRequest};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Gemini API client using API key authentication.
#[derive(Clone)]
pub struct GeminiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
}

impl GeminiClient {
    /// Create a new Gemini client with API key.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: GEMINI_API_URL.to_string(),
            client: Client::new(),
        }
    }

    /// Point the client at a different API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_url(&self) -> String {
        format!(
            "{}/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }

    fn build_request(&self, request: &PromptRequest) -> Value {
        let mut body = json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": request.prompt}]
            }],
            "generationConfig": {
                "temperature": 0.7,
                "maxOutputTokens": 8192
            }
        });

        if let Some(ref system) = request.system {
            body["systemInstruction"] = json!({
                "parts": [{"text": system}]
            });
        }

        body
    }
}

/// Decode one SSE payload into the text it contributes.
pub(crate) fn parse_event(data: &str) -> Result<String> {
    let response: GeminiResponse = serde_json::from_str(data)
        .map_err(|e| Error::Model(format!("Failed to parse stream chunk: {e}")))?;

    if let Some(err) = response.error {
        return Err(Error::Model(format!("Gemini API error: {}", err.message)));
    }

    if let Some(reason) = response
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref())
    {
        if matches!(reason, "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT") {
            return Err(Error::Model(format!("Generation stopped: {reason}")));
        }
    }

    Ok(response.text())
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn stream(&self, request: &PromptRequest) -> Result<ChunkStream> {
        let body = self.build_request(request);
        debug!(model = %self.model, "Opening Gemini stream");

        let response = self.client.post(self.build_url()).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(Error::Model(format!("Gemini API error ({status}): {error_text}")));
        }

        let chunks = SseStream::new(response.bytes_stream())
            .and_then(|data| future::ready(parse_event(&data)))
            .try_filter(|text| future::ready(!text.is_empty()));

        Ok(chunks.boxed())
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}
