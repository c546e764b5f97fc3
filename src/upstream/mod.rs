// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Upstream completion service integration
//!
//! Talks to an OpenAI-compatible `chat/completions` endpoint, plus the
//! optional `/moderations` endpoint when a moderation key is configured.
//!
//! Each call is a single attempt. The gateway answers an interactive visitor
//! and already bounds the whole call with a timeout, so there is no retry
//! loop here; a failed attempt surfaces straight to the orchestrator.
//!
//! The orchestrator only sees the [`CompletionBackend`] trait, which lets
//! tests swap in a scripted backend without a network.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::types::Message;

/// Default OpenAI API endpoint.
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Default chat model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default completion length cap.
pub const DEFAULT_MAX_TOKENS: u32 = 300;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default bound on a single upstream call (in seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Upstream error bodies are cut to this many characters before logging.
const MAX_ERROR_BODY_CHARS: usize = 512;

// ============================================================================
// SETTINGS
// ============================================================================

/// Upstream connection and generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub model: String,
    /// Completion API key. Usually supplied through `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Enables content moderation when set.
    pub moderation_api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            moderation_api_key: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl UpstreamSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Body of a chat completion request, minus the model name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Chat completion response as returned by the service.
///
/// Deserialization is lenient about everything except types: a missing
/// `choices` list parses, and [`CompletionPayload::answer`] reports it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionPayload {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl CompletionPayload {
    /// Payload carrying a single answer. Used by scripted backends.
    pub fn with_answer(answer: impl Into<String>) -> Self {
        Self {
            choices: vec![CompletionChoice {
                message: Some(ChoiceMessage {
                    content: Some(answer.into()),
                }),
            }],
            model: None,
            usage: None,
        }
    }

    /// Trimmed text of `choices[0].message.content`, if present and non-blank.
    pub fn answer(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
    flagged: bool,
}

// ============================================================================
// ERRORS
// ============================================================================

/// Failure talking to the upstream service.
///
/// These carry internal detail for logs. None of it is shown to callers.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("upstream API key is not configured")]
    NotConfigured,

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream network error: {0}")]
    Network(String),

    #[error("upstream payload malformed: {0}")]
    Malformed(String),
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

/// Something that can answer a prompt.
pub trait CompletionBackend: Send + Sync + 'static {
    /// One completion attempt.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<CompletionPayload, UpstreamError>> + Send;

    /// Whether `text` is flagged by content moderation.
    ///
    /// Backends without moderation never flag anything.
    fn moderate(&self, _text: &str) -> impl Future<Output = Result<bool, UpstreamError>> + Send {
        async { Ok::<bool, UpstreamError>(false) }
    }

    /// Whether [`CompletionBackend::moderate`] does anything.
    fn moderation_enabled(&self) -> bool {
        false
    }
}

// ============================================================================
// OPENAI CLIENT
// ============================================================================

/// Client for an OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    moderation_api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, UpstreamError> {
        let timeout = settings.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("askgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpstreamError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone().filter(|k| !k.trim().is_empty()),
            moderation_api_key: settings.moderation_api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout,
        })
    }

    /// Check if the client is configured with an API key.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post_json(&self, path: &str, key: &str, body: &serde_json::Value) -> Result<String, UpstreamError> {
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.classify_send_error(e))?;

        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }
        Ok(text)
    }

    fn classify_send_error(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else if e.is_connect() {
            UpstreamError::Network(format!("failed to connect: {e}"))
        } else {
            UpstreamError::Network(e.to_string())
        }
    }
}

impl CompletionBackend for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionPayload, UpstreamError> {
        let key = self.api_key.as_deref().ok_or(UpstreamError::NotConfigured)?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            "Sending completion request"
        );

        let text = self.post_json("chat/completions", key, &body).await?;
        let payload: CompletionPayload =
            serde_json::from_str(&text).map_err(|e| UpstreamError::Malformed(e.to_string()))?;

        if let Some(usage) = payload.usage() {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Completion usage"
            );
        }
        Ok(payload)
    }

    async fn moderate(&self, text: &str) -> Result<bool, UpstreamError> {
        let Some(key) = self.moderation_api_key.as_deref() else {
            return Ok(false);
        };

        let body = serde_json::json!({ "input": text });
        let raw = self.post_json("moderations", key, &body).await?;
        let parsed: ModerationResponse =
            serde_json::from_str(&raw).map_err(|e| UpstreamError::Malformed(e.to_string()))?;

        if parsed.results.is_empty() {
            return Err(UpstreamError::Malformed("moderation response has no results".to_string()));
        }
        Ok(parsed.results.iter().any(|r| r.flagged))
    }

    fn moderation_enabled(&self) -> bool {
        self.moderation_api_key.is_some()
    }
}
