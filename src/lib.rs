// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! askgate - admission-control gateway for an LLM assistant
//!
//! Sits in front of an OpenAI-compatible completion API and decides, per
//! request, whether the upstream model gets called at all:
//!
//! **Client key** -> **Origin** -> **Rate limit** -> **Validation** -> **Guardrail** -> **Upstream**
//!
//! # Core Modules
//!
//! - [`client_id`] - Caller identification from proxy headers
//! - [`ratelimit`] - Sliding-window per-client rate limiting
//! - [`validate`] - Question and context validation
//! - [`guardrail`] - Topic and language admission rules
//! - [`prompt`] - Prompt construction
//! - [`upstream`] - Completion API client
//! - [`orchestrator`] - Stage sequencing
//! - [`server`] - HTTP surface
//! - [`errors`] - User-facing error responses

pub mod client_id;
pub mod config;
pub mod errors;
pub mod guardrail;
pub mod locks;
pub mod orchestrator;
pub mod prompt;
pub mod ratelimit;
pub mod server;
pub mod types;
pub mod upstream;
pub mod validate;

pub use client_id::{identify_client, ClientKey};
pub use config::{ConfigError, GatewayConfig};
pub use errors::{ApiResult, ErrorResponse, UserError};
pub use guardrail::{AdmissionGuardrail, AllowReason, BlockReason, GuardrailVerdict, SubjectProfile};
pub use orchestrator::{CompletionOrchestrator, GatewayError, OriginPolicy, Reply};
pub use prompt::PromptBuilder;
pub use ratelimit::{Clock, Limiter, ManualClock, SlidingWindowLimiter, SystemClock};
pub use server::{build_router, Server};
pub use types::{Message, Role};
pub use upstream::{CompletionBackend, CompletionPayload, CompletionRequest, OpenAiClient, UpstreamError};
pub use validate::{RequestValidator, ValidatedContext, ValidatedQuestion, ValidationError};
