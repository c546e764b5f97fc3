// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User-facing error responses
//!
//! Every terminal failure leaves the gateway as a [`UserError`]:
//! - a stable `error_type` tag and HTTP status
//! - a message safe to show a website visitor
//! - a unique reference code that ties the response to the log line
//!
//! Caller-input errors (validation, origin, rate limit) keep their specific
//! message, since the caller can act on it. Upstream failures always get a
//! generic message; the detail goes to the log after redaction and never
//! into the response body.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::Level;

use crate::orchestrator::GatewayError;

const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A fresh `ERR-YYYYMMDD-XXXXXX` code, e.g. `ERR-20250114-K7QW2M`.
///
/// The suffix alphabet leaves out `0`, `O`, `1` and `I` so visitors can read
/// the code back over email without ambiguity.
pub fn generate_reference_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())] as char)
        .collect();
    format!("ERR-{}-{suffix}", Utc::now().format("%Y%m%d"))
}

// =============================================================================
// USER-FACING ERROR TYPES
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum UserError {
    /// Invalid request from client (400)
    InvalidRequest {
        message: String,
        reference: String,
        /// Machine-readable validation kind (`invalid_input`, `too_long`, ...).
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Origin not on the allow-list (403)
    Forbidden {
        message: String,
        reference: String,
    },

    /// Rate limited (429)
    RateLimited {
        message: String,
        reference: String,
        retry_after_minutes: u64,
        retry_after_secs: u64,
    },

    /// Request entity too large (413)
    PayloadTooLarge {
        message: String,
        reference: String,
        max_size: u64,
    },

    /// Internal server error (500) - NEVER exposes internal details
    InternalError {
        message: String,
        reference: String,
    },

    /// Upstream failed or answered with garbage (502)
    BadGateway {
        message: String,
        reference: String,
    },

    /// Upstream did not answer in time (504)
    GatewayTimeout {
        message: String,
        reference: String,
    },
}

impl UserError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UserError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            UserError::Forbidden { .. } => StatusCode::FORBIDDEN,
            UserError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            UserError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UserError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UserError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            UserError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn reference(&self) -> &str {
        self.parts().1
    }

    /// The text shown to the visitor.
    pub fn message(&self) -> &str {
        self.parts().0
    }

    fn parts(&self) -> (&str, &str) {
        match self {
            UserError::InvalidRequest { message, reference, .. }
            | UserError::Forbidden { message, reference }
            | UserError::RateLimited { message, reference, .. }
            | UserError::PayloadTooLarge { message, reference, .. }
            | UserError::InternalError { message, reference }
            | UserError::BadGateway { message, reference }
            | UserError::GatewayTimeout { message, reference } => (message, reference),
        }
    }
}

/// User-facing error response structure (JSON format).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: UserError,
    pub status: u16,
}

impl IntoResponse for UserError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            UserError::RateLimited { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        };
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        let mut res = (status, [(header::CONTENT_TYPE, "application/json")], body).into_response();
        if let Some(secs) = retry_after {
            res.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        res
    }
}

/// Result type that uses UserError for the error variant.
pub type ApiResult<T> = Result<T, UserError>;

const UPSTREAM_UNAVAILABLE: &str = "The assistant is unavailable right now. Please try again later.";
const UPSTREAM_TOO_SLOW: &str = "The assistant took too long to respond. Please try again.";
const ORIGIN_DENIED: &str = "Access denied. This origin is not allowed to use the assistant.";

/// Mint a reference and log `detail` (redacted) against it.
fn logged_reference(level: Level, summary: &str, detail: Option<&str>) -> String {
    let reference = generate_reference_code();
    let detail = detail.map(redact_secrets).unwrap_or_default();
    if level == Level::ERROR {
        tracing::error!(%reference, %detail, "{}", summary);
    } else if level == Level::WARN {
        tracing::warn!(%reference, %detail, "{}", summary);
    } else {
        tracing::info!(%reference, %detail, "{}", summary);
    }
    reference
}

impl UserError {
    /// A 400 carrying the validation `kind` and `field` when known.
    ///
    /// `internal` is logged at warn; without it the rejection is routine and
    /// logged at info.
    pub fn invalid_request(user_message: &str, kind: Option<&str>, field: Option<&str>, internal: Option<&str>) -> Self {
        let level = if internal.is_some() { Level::WARN } else { Level::INFO };
        let summary = format!("Invalid request (kind={}, field={})", kind.unwrap_or("-"), field.unwrap_or("-"));
        Self::InvalidRequest {
            message: user_message.to_string(),
            reference: logged_reference(level, &summary, internal),
            kind: kind.map(str::to_string),
            field: field.map(str::to_string),
        }
    }

    pub fn forbidden(internal_reason: Option<&str>) -> Self {
        Self::Forbidden {
            message: ORIGIN_DENIED.to_string(),
            reference: logged_reference(Level::WARN, "Origin rejected", internal_reason),
        }
    }

    /// A 429. The body reports whole minutes (rounded up) and the
    /// `Retry-After` header carries seconds.
    pub fn rate_limited(retry_after: Duration) -> Self {
        let retry_after_secs = retry_after.as_secs().max(1);
        let retry_after_minutes = retry_after_secs.div_ceil(60);
        let plural = if retry_after_minutes == 1 { "" } else { "s" };
        Self::RateLimited {
            message: format!("Too many requests. Please try again in {retry_after_minutes} minute{plural}."),
            reference: logged_reference(Level::WARN, "Rate limited", Some(&format!("retry after {retry_after_secs}s"))),
            retry_after_minutes,
            retry_after_secs,
        }
    }

    pub fn payload_too_large(max_size: u64) -> Self {
        Self::PayloadTooLarge {
            message: format!("Request body too large. Maximum size is {max_size} bytes."),
            reference: logged_reference(Level::WARN, "Payload too large", None),
            max_size,
        }
    }

    /// A 500. `internal_error` goes to the log only; the visitor sees the
    /// reference code and nothing else.
    pub fn internal_error(internal_error: &str) -> Self {
        let reference = logged_reference(Level::ERROR, "Internal server error", Some(internal_error));
        Self::InternalError {
            message: format!("An internal error occurred. Reference: {reference}"),
            reference,
        }
    }

    pub fn gateway_timeout(internal_details: &str) -> Self {
        Self::GatewayTimeout {
            message: UPSTREAM_TOO_SLOW.to_string(),
            reference: logged_reference(Level::ERROR, "Upstream timed out", Some(internal_details)),
        }
    }

    pub fn bad_gateway(internal_details: &str) -> Self {
        Self::BadGateway {
            message: UPSTREAM_UNAVAILABLE.to_string(),
            reference: logged_reference(Level::ERROR, "Upstream failed", Some(internal_details)),
        }
    }
}

// =============================================================================
// MAPPING FROM GATEWAY OUTCOMES
// =============================================================================

impl From<GatewayError> for UserError {
    fn from(err: GatewayError) -> Self {
        match &err {
            GatewayError::OriginForbidden { .. } => UserError::forbidden(Some(&err.to_string())),
            GatewayError::RateLimited { retry_after } => UserError::rate_limited(*retry_after),
            GatewayError::MalformedRequestBody(detail) => UserError::invalid_request(
                "Request body must be a JSON object.",
                Some("malformed_body"),
                None,
                Some(detail),
            ),
            GatewayError::Validation(e) => {
                UserError::invalid_request(&e.to_string(), Some(e.kind()), Some(e.field()), None)
            }
            GatewayError::UpstreamTimeout(_) => UserError::gateway_timeout(&err.to_string()),
            GatewayError::Upstream(_) | GatewayError::UpstreamMalformed(_) => {
                UserError::bad_gateway(&err.to_string())
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        UserError::from(self).into_response()
    }
}

// =============================================================================
// REDACTION
// =============================================================================

/// Secrets that can surface in upstream error bodies and reqwest errors.
const REDACTIONS: &[(&str, &str)] = &[
    (r"sk-(?:proj-)?[A-Za-z0-9_-]{20,}", "[API_KEY_REDACTED]"),
    (r"Bearer [A-Za-z0-9._~+/-]+=*", "Bearer [TOKEN_REDACTED]"),
    (r"(?i)(api[_-]?key|token)=[^&\s]+", "${1}=[REDACTED]"),
    (r"\b\d{1,3}(?:\.\d{1,3}){3}\b", "[IP_REDACTED]"),
    (r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b", "[EMAIL_REDACTED]"),
    (r"\b[A-Za-z0-9]{40,}\b", "[SECRET_REDACTED]"),
];

static REDACTION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    REDACTIONS
        .iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, *replacement)))
        .collect()
});

/// Strip keys, tokens, addresses, and emails from a detail string before it is
/// logged.
pub fn redact_secrets(detail: &str) -> String {
    REDACTION_PATTERNS
        .iter()
        .fold(detail.to_string(), |acc, (re, replacement)| re.replace_all(&acc, *replacement).into_owned())
}

// =============================================================================
// TESTS
// =============================================================================
