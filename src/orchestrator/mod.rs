// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request sequencing.
//!
//! [`CompletionOrchestrator::handle`] runs the admission stages in a fixed
//! order and stops at the first one that rejects:
//!
//! 1. client identification
//! 2. origin allow-list
//! 3. rate limit
//! 4. body parse and validation
//! 5. guardrail, then optional moderation
//! 6. prompt build and upstream call under a timeout
//!
//! A guardrail or moderation block is a successful [`Reply::Redirected`],
//! not an error. The upstream model is only contacted for admitted
//! questions.

use axum::http::{header, HeaderMap};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::client_id::{identify_client, ClientKey};
use crate::config::GatewayConfig;
use crate::guardrail::{AdmissionGuardrail, BlockReason, GuardrailVerdict};
use crate::prompt::PromptBuilder;
use crate::ratelimit::{Limiter, SlidingWindowLimiter};
use crate::upstream::{
    CompletionBackend, CompletionRequest, UpstreamError, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
    DEFAULT_TIMEOUT_SECS,
};
use crate::validate::{RequestValidator, ValidatedQuestion, ValidationError};

// ============================================================================
// OUTCOMES
// ============================================================================

/// Terminal failure of a request. Guardrail blocks are not errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("origin {origin:?} is not allowed")]
    OriginForbidden { origin: String },

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("malformed request body: {0}")]
    MalformedRequestBody(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error(transparent)]
    Upstream(UpstreamError),

    #[error("upstream payload malformed: {0}")]
    UpstreamMalformed(String),
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout(after) => Self::UpstreamTimeout(after),
            UpstreamError::Malformed(detail) => Self::UpstreamMalformed(detail),
            other => Self::Upstream(other),
        }
    }
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The upstream model's answer.
    Answered { answer: String },
    /// A fixed redirect message; upstream was not asked.
    Redirected { reason: BlockReason, message: String },
}

/// JSON body of a [`Reply`].
#[derive(Debug, Serialize)]
pub struct ReplyBody<'a> {
    pub answer: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<BlockReason>,
}

impl Reply {
    pub fn body(&self) -> ReplyBody<'_> {
        match self {
            Reply::Answered { answer } => ReplyBody {
                answer,
                guardrail: None,
            },
            Reply::Redirected { reason, message } => ReplyBody {
                answer: message,
                guardrail: Some(*reason),
            },
        }
    }
}

// ============================================================================
// ORIGIN POLICY
// ============================================================================

/// Allow-list of browser origins.
///
/// An empty list allows everything. A request without an `Origin` header
/// (curl, server-to-server) is always allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = origins
            .into_iter()
            .map(|o| normalize_origin(o.as_ref()))
            .filter(|o| !o.is_empty())
            .collect();
        Self { allowed }
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn origins(&self) -> &[String] {
        &self.allowed
    }

    pub fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.is_open() => true,
            Some(o) => {
                let o = normalize_origin(o);
                self.allowed.iter().any(|a| *a == o)
            }
        }
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct CompletionOrchestrator<B> {
    backend: B,
    limiter: Arc<dyn Limiter>,
    validator: RequestValidator,
    guardrail: AdmissionGuardrail,
    prompt: PromptBuilder,
    origins: OriginPolicy,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl<B: CompletionBackend> CompletionOrchestrator<B> {
    pub fn new(backend: B, limiter: Arc<dyn Limiter>, guardrail: AdmissionGuardrail, prompt: PromptBuilder) -> Self {
        Self {
            backend,
            limiter,
            validator: RequestValidator::default(),
            guardrail,
            prompt,
            origins: OriginPolicy::allow_all(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Wire every stage from configuration.
    pub fn from_config(config: &GatewayConfig, backend: B) -> Result<Self, regex::Error> {
        let guardrail = AdmissionGuardrail::new(&config.subject)?;
        let limiter: Arc<dyn Limiter> = Arc::new(SlidingWindowLimiter::from_settings(&config.rate_limit));
        let prompt = PromptBuilder::new(config.effective_system_prompt(), config.background_info.as_str());

        Ok(Self::new(backend, limiter, guardrail, prompt)
            .with_validator(RequestValidator::new(config.limits))
            .with_origin_policy(OriginPolicy::new(&config.server.allowed_origins))
            .with_generation(config.upstream.max_tokens, config.upstream.temperature)
            .with_timeout(config.upstream.timeout()))
    }

    pub fn with_validator(mut self, validator: RequestValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_origin_policy(mut self, origins: OriginPolicy) -> Self {
        self.origins = origins;
        self
    }

    pub fn with_generation(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn origins(&self) -> &OriginPolicy {
        &self.origins
    }

    pub fn guardrail(&self) -> &AdmissionGuardrail {
        &self.guardrail
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one request through every stage.
    pub async fn handle(&self, headers: &HeaderMap, body: &[u8]) -> Result<Reply, GatewayError> {
        let client = identify_client(headers);

        let origin = headers
            .get(header::ORIGIN)
            .map(|v| v.to_str().unwrap_or_default());
        if !self.origins.allows(origin) {
            return Err(GatewayError::OriginForbidden {
                origin: origin.unwrap_or_default().to_string(),
            });
        }

        if !self.limiter.admit(&client) {
            return Err(GatewayError::RateLimited {
                retry_after: self.limiter.window(),
            });
        }

        let parsed: Value =
            serde_json::from_slice(body).map_err(|e| GatewayError::MalformedRequestBody(e.to_string()))?;
        let Some(fields) = parsed.as_object() else {
            return Err(GatewayError::MalformedRequestBody("body is not a JSON object".to_string()));
        };

        let question = self.validator.validate_question(fields.get("question"))?;
        let context = self.validator.validate_context(fields.get("context"))?;

        if let Some(redirect) = self.screen(&client, &question).await {
            return Ok(redirect);
        }

        let request = CompletionRequest {
            messages: self.prompt.build(&context, &question),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let payload = match tokio::time::timeout(self.timeout, self.backend.complete(&request)).await {
            Ok(result) => result?,
            Err(_) => return Err(GatewayError::UpstreamTimeout(self.timeout)),
        };

        let answer = payload
            .answer()
            .ok_or_else(|| GatewayError::UpstreamMalformed("missing choices[0].message.content".to_string()))?;

        tracing::info!(client = %client, context_turns = context.len(), "Question answered");
        Ok(Reply::Answered {
            answer: answer.to_string(),
        })
    }

    /// Guardrail plus moderation. `Some` means redirect.
    async fn screen(&self, client: &ClientKey, question: &ValidatedQuestion) -> Option<Reply> {
        match self.guardrail.classify(question) {
            GuardrailVerdict::Blocked { reason, message } => {
                tracing::info!(client = %client, reason = reason.as_str(), "Question redirected by guardrail");
                return Some(Reply::Redirected { reason, message });
            }
            GuardrailVerdict::Allowed(reason) => {
                tracing::debug!(client = %client, reason = ?reason, "Question allowed by guardrail");
            }
        }

        if !self.backend.moderation_enabled() {
            return None;
        }

        match tokio::time::timeout(self.timeout, self.backend.moderate(question.as_str())).await {
            Ok(Ok(true)) => {
                tracing::info!(client = %client, "Question flagged by moderation");
                match self.guardrail.blocked(BlockReason::Moderated) {
                    GuardrailVerdict::Blocked { reason, message } => Some(Reply::Redirected { reason, message }),
                    GuardrailVerdict::Allowed(_) => None,
                }
            }
            Ok(Ok(false)) => None,
            // Moderation is advisory; the guardrail already admitted the question.
            Ok(Err(e)) => {
                tracing::warn!(client = %client, error = %e, "Moderation failed, continuing without it");
                None
            }
            Err(_) => {
                tracing::warn!(client = %client, "Moderation timed out, continuing without it");
                None
            }
        }
    }
}
