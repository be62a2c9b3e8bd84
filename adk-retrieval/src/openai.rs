//! OpenAI embedding function and chat model using the OpenAI REST API.
//!
//! This module is only available when the `openai` feature is enabled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::embedding::EmbeddingFunction;
use crate::error::{RagError, Result};
use crate::llm::LanguageModel;

/// The default OpenAI API base URL.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// The default model for OpenAI embeddings.
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// The default chat model.
const DEFAULT_CHAT_MODEL: &str = "gpt-4";

const SERVICE: &str = "OpenAI";

/// Known output sizes of the OpenAI embedding models.
fn default_dimensions(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

fn api_key_from_env() -> Result<String> {
    std::env::var("OPENAI_API_KEY").map_err(|_| {
        RagError::Configuration("OPENAI_API_KEY environment variable not set".into())
    })
}

fn check_api_key(api_key: &str) -> Result<()> {
    if api_key.is_empty() {
        return Err(RagError::Configuration("OpenAI API key must not be empty".into()));
    }
    Ok(())
}

/// Turn a non-success response into an error carrying the API's message.
async fn api_error(response: reqwest::Response) -> RagError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail =
        serde_json::from_str::<ErrorResponse>(&body).map(|e| e.error.message).unwrap_or(body);
    error!(service = SERVICE, %status, "API error");
    RagError::external(SERVICE, format!("API returned {status}: {detail}"))
}

/// An [`EmbeddingFunction`] backed by the OpenAI embeddings API.
///
/// Uses `reqwest` to call the `/v1/embeddings` endpoint directly.
///
/// # Configuration
///
/// - `model` – defaults to `text-embedding-3-small`.
/// - `dimensions` – optional Matryoshka dimension override.
/// - `api_key` – from the constructor or the `OPENAI_API_KEY` environment variable.
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::openai::OpenAIEmbeddingFunction;
///
/// let function = OpenAIEmbeddingFunction::new("sk-...")?;
/// let vectors = function.embed(&["hello world"]).await?;
/// ```
pub struct OpenAIEmbeddingFunction {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: Option<usize>,
    /// If set, passed to the API for Matryoshka dimension truncation.
    request_dimensions: Option<usize>,
}

impl OpenAIEmbeddingFunction {
    /// Create a new function with the given API key and the default model.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        check_api_key(&api_key)?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: OPENAI_BASE_URL.into(),
            model: DEFAULT_EMBEDDING_MODEL.into(),
            dimensions: default_dimensions(DEFAULT_EMBEDDING_MODEL),
            request_dimensions: None,
        })
    }

    /// Create a new function using the `OPENAI_API_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        Self::new(api_key_from_env()?)
    }

    /// Set the model name (e.g. `text-embedding-3-large`).
    ///
    /// Unknown models leave the dimensionality undeclared, so it is inferred
    /// on first use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.dimensions = self.request_dimensions.or_else(|| default_dimensions(&self.model));
        self
    }

    /// Set the output dimensions (Matryoshka support).
    pub fn with_dimensions(mut self, dims: usize) -> Self {
        self.dimensions = Some(dims);
        self.request_dimensions = Some(dims);
        self
    }

    /// Point the function at an OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

// ── OpenAI API request/response types ──────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

// ── EmbeddingFunction implementation ───────────────────────────────

#[async_trait]
impl EmbeddingFunction for OpenAIEmbeddingFunction {
    async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            service = SERVICE,
            batch_size = inputs.len(),
            model = %self.model,
            "embedding batch"
        );

        let request_body = EmbeddingRequest {
            model: &self.model,
            input: inputs.to_vec(),
            dimensions: self.request_dimensions,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                error!(service = SERVICE, error = %e, "request failed");
                RagError::external(SERVICE, format!("request failed: {e}"))
            })?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let mut embedding_response: EmbeddingResponse = response.json().await.map_err(|e| {
            error!(service = SERVICE, error = %e, "failed to parse response");
            RagError::external(SERVICE, format!("failed to parse response: {e}"))
        })?;

        embedding_response.data.sort_by_key(|d| d.index);
        Ok(embedding_response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_name(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }
}

/// A [`LanguageModel`] backed by the OpenAI chat completions API.
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::openai::OpenAIChatModel;
///
/// let model = OpenAIChatModel::from_env()?.with_model("gpt-4o");
/// let reply = model.complete("You are terse.", "Say hi").await?;
/// ```
pub struct OpenAIChatModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f32>,
}

impl OpenAIChatModel {
    /// Create a new chat model with the given API key and the default model.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        check_api_key(&api_key)?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: OPENAI_BASE_URL.into(),
            model: DEFAULT_CHAT_MODEL.into(),
            temperature: None,
        })
    }

    /// Create a new chat model using the `OPENAI_API_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        Self::new(api_key_from_env()?)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Point the model at an OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LanguageModel for OpenAIChatModel {
    async fn complete(&self, system_message: &str, user_message: &str) -> Result<String> {
        debug!(
            service = SERVICE,
            model = %self.model,
            prompt_len = user_message.len(),
            "chat completion"
        );

        let request_body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage { role: "system", content: system_message },
                ChatMessage { role: "user", content: user_message },
            ],
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                error!(service = SERVICE, error = %e, "request failed");
                RagError::external(SERVICE, format!("request failed: {e}"))
            })?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            error!(service = SERVICE, error = %e, "failed to parse response");
            RagError::external(SERVICE, format!("failed to parse response: {e}"))
        })?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RagError::external(SERVICE, "API returned no completion"))
    }

    fn model_name(&self) -> Option<&str> {
        Some(&self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(OpenAIEmbeddingFunction::new("").is_err_and(|e| e.is_configuration()));
        assert!(OpenAIChatModel::new("").is_err_and(|e| e.is_configuration()));
    }

    #[test]
    fn dimensions_follow_the_model() {
        let function = OpenAIEmbeddingFunction::new("sk-test").unwrap();
        assert_eq!(EmbeddingFunction::dimensions(&function), Some(1536));

        let large =
            OpenAIEmbeddingFunction::new("sk-test").unwrap().with_model("text-embedding-3-large");
        assert_eq!(EmbeddingFunction::dimensions(&large), Some(3072));

        let custom = OpenAIEmbeddingFunction::new("sk-test").unwrap().with_model("in-house");
        assert_eq!(EmbeddingFunction::dimensions(&custom), None);

        let truncated = large.with_dimensions(256);
        assert_eq!(EmbeddingFunction::dimensions(&truncated), Some(256));
    }
}
