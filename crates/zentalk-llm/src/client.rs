//! HTTP completion client
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint. The
//! endpoint, credential and model come from configuration so the same
//! client covers hosted APIs and local inference servers.

use crate::error::{Error, Result};
use crate::message::{CompletionRequest, CompletionResponse};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Default model when none is configured
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// Backend trait
// ============================================================================

/// Trait for completion backends
///
/// Allows the reply generator to run against the HTTP client in
/// production and a canned backend in tests.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Generate a completion
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Backend name (for logging)
    fn name(&self) -> &str;
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the HTTP completion client
#[derive(Clone)]
pub struct CompletionConfig {
    /// Base URL of the completion API
    pub base_url: String,
    /// Bearer credential, if the endpoint requires one
    pub api_key: Option<String>,
    /// Default model to use for completions
    pub default_model: String,
    /// Request timeout duration
    pub timeout: Duration,
}

impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("default_model", &self.default_model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CompletionConfig {
    /// Create a new configuration for the given endpoint
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            default_model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Reads `LLM_API_URL` (required), `LLM_API_KEY` and `LLM_MODEL`.
    ///
    /// # Errors
    /// Returns error if `LLM_API_URL` is not set
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("LLM_API_URL")
            .map_err(|_| Error::NotConfigured("LLM_API_URL not set".to_string()))?;
        let api_key = std::env::var("LLM_API_KEY").ok();
        let default_model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self {
            base_url,
            api_key,
            default_model,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set the bearer credential
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the default model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============================================================================
// Client
// ============================================================================

/// Completion client for OpenAI-compatible chat endpoints
pub struct HttpCompletionClient {
    client: Client,
    config: CompletionConfig,
}

impl HttpCompletionClient {
    /// Create a new client with the given configuration
    pub fn new(config: CompletionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Create a client from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(CompletionConfig::from_env()?)
    }

    /// The configured default model
    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    async fn send_request(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        debug!("Sending completion request for model {}", request.model);

        let mut builder = self.client.post(&url).json(&request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.config.timeout.as_millis() as u64)
            } else {
                Error::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(Error::Api(error.error.message));
            }
            return Err(Error::Api(format!("completion endpoint returned {}", status)));
        }

        serde_json::from_str(&body).map_err(|e| Error::InvalidResponse(e.to_string()))
    }
}

#[async_trait::async_trait]
impl CompletionBackend for HttpCompletionClient {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = if request.model.is_empty() {
            self.config.default_model.clone()
        } else {
            request.model
        };

        let chat_request = ChatRequest {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self.send_request(chat_request).await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::InvalidResponse("response contained no choices".to_string()))?;

        Ok(CompletionResponse {
            content,
            model: response.model,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}
