// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structural validation of the question and its conversation history.
//!
//! Input arrives as untyped JSON. Everything that leaves this module is
//! trimmed and bounded: a [`ValidatedQuestion`] can be handed to the
//! guardrail and the prompt builder without further checks.
//!
//! Lengths are counted in characters after trimming, never in bytes, so a
//! question in a multi-byte script is held to the same limit as ASCII.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum characters in the current question.
pub const MAX_QUESTION_LENGTH: usize = 500;

/// Maximum prior turns in the conversation history.
pub const MAX_CONTEXT_ITEMS: usize = 10;

/// Maximum characters in each prior question or answer.
pub const MAX_CONTEXT_ITEM_LENGTH: usize = 1000;

// ============================================================================
// ERRORS
// ============================================================================

/// Why a request body was rejected. Always a caller-input error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Missing, wrongly typed, or empty value.
    #[error("{message}")]
    InvalidInput { field: String, message: String },

    /// A string longer than its limit after trimming.
    #[error("{field} exceeds maximum length of {limit} characters")]
    TooLong { field: String, limit: usize },

    /// More context turns than allowed.
    #[error("context cannot exceed {limit} items (got {actual})")]
    TooMany { limit: usize, actual: usize },
}

impl ValidationError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::TooLong { .. } => "too_long",
            Self::TooMany { .. } => "too_many",
        }
    }

    /// JSON path of the offending value.
    pub fn field(&self) -> &str {
        match self {
            Self::InvalidInput { field, .. } | Self::TooLong { field, .. } => field,
            Self::TooMany { .. } => "context",
        }
    }
}

// ============================================================================
// VALIDATED TYPES
// ============================================================================

/// A trimmed, non-empty, length-bounded question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuestion(String);

impl ValidatedQuestion {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// One prior exchange, both sides trimmed and bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextTurn {
    question: String,
    answer: String,
}

impl ContextTurn {
    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }
}

/// Prior turns, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedContext(Vec<ContextTurn>);

impl ValidatedContext {
    pub fn turns(&self) -> &[ContextTurn] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

/// Size limits, configurable but defaulting to the published constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_question_length: usize,
    pub max_context_items: usize,
    pub max_context_item_length: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_question_length: MAX_QUESTION_LENGTH,
            max_context_items: MAX_CONTEXT_ITEMS,
            max_context_item_length: MAX_CONTEXT_ITEM_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestValidator {
    limits: ValidationLimits,
}

impl RequestValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Validate the `question` field of a request body.
    pub fn validate_question(&self, raw: Option<&Value>) -> Result<ValidatedQuestion, ValidationError> {
        let text = match raw {
            Some(Value::String(s)) => s.trim(),
            _ => "",
        };
        if text.is_empty() {
            return Err(ValidationError::invalid(
                "question",
                "Question is required and must be a non-empty string",
            ));
        }
        bounded("question", text, self.limits.max_question_length).map(ValidatedQuestion)
    }

    /// Validate the optional `context` field of a request body.
    ///
    /// A bad turn rejects the whole request; turns are never silently
    /// dropped.
    pub fn validate_context(&self, raw: Option<&Value>) -> Result<ValidatedContext, ValidationError> {
        let items = match raw {
            None | Some(Value::Null) => return Ok(ValidatedContext::default()),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(ValidationError::invalid("context", "Context must be an array")),
        };

        if items.len() > self.limits.max_context_items {
            return Err(ValidationError::TooMany {
                limit: self.limits.max_context_items,
                actual: items.len(),
            });
        }

        let limit = self.limits.max_context_item_length;
        items
            .iter()
            .enumerate()
            .map(|(idx, item)| -> Result<ContextTurn, ValidationError> {
                let (question, answer) = turn_fields(item).ok_or_else(|| {
                    ValidationError::invalid(
                        format!("context[{idx}]"),
                        format!("Context item {idx} must be an object with string question and answer fields"),
                    )
                })?;
                Ok(ContextTurn {
                    question: bounded(&format!("context[{idx}].question"), question.trim(), limit)?,
                    answer: bounded(&format!("context[{idx}].answer"), answer.trim(), limit)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ValidatedContext)
    }
}

fn turn_fields(item: &Value) -> Option<(&str, &str)> {
    let obj = item.as_object()?;
    let question = obj.get("question")?.as_str()?;
    let answer = obj.get("answer")?.as_str()?;
    Some((question, answer))
}

fn bounded(field: &str, trimmed: &str, limit: usize) -> Result<String, ValidationError> {
    if trimmed.chars().count() > limit {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            limit,
        });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn(q: &str, a: &str) -> Value {
        json!({ "question": q, "answer": a })
    }

    #[test]
    fn test_question_empty_and_missing_are_invalid() {
        let v = RequestValidator::default();
        for raw in [Some(json!("")), Some(json!("   ")), None, Some(json!(42)), Some(Value::Null)] {
            let err = v.validate_question(raw.as_ref()).unwrap_err();
            assert_eq!(err.kind(), "invalid_input", "input {:?}", raw);
            assert_eq!(err.field(), "question");
        }
    }

    #[test]
    fn test_question_length_boundary() {
        let v = RequestValidator::default();

        let ok = "a".repeat(500);
        assert_eq!(v.validate_question(Some(&json!(ok))).unwrap().as_str().len(), 500);

        let long = "a".repeat(501);
        let err = v.validate_question(Some(&json!(long))).unwrap_err();
        assert_eq!(err, ValidationError::TooLong { field: "question".into(), limit: 500 });
    }

    #[test]
    fn test_question_trimmed_before_measuring() {
        let v = RequestValidator::default();
        let padded = format!("   {}   ", "b".repeat(500));
        let q = v.validate_question(Some(&json!(padded))).unwrap();
        assert_eq!(q.into_inner(), "b".repeat(500));
    }

    #[test]
    fn test_question_length_counts_chars_not_bytes() {
        let v = RequestValidator::default();
        let accented = "é".repeat(500);
        assert!(v.validate_question(Some(&json!(accented))).is_ok());
    }

    #[test]
    fn test_context_absent_or_null_is_empty() {
        let v = RequestValidator::default();
        assert!(v.validate_context(None).unwrap().is_empty());
        assert!(v.validate_context(Some(&Value::Null)).unwrap().is_empty());
    }

    #[test]
    fn test_context_not_array_is_invalid() {
        let v = RequestValidator::default();
        let err = v.validate_context(Some(&json!({"question": "q"}))).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(err.field(), "context");
    }

    #[test]
    fn test_context_item_count_boundary() {
        let v = RequestValidator::default();

        let ten: Vec<Value> = (0..10).map(|i| turn(&format!("q{i}"), &format!("a{i}"))).collect();
        assert_eq!(v.validate_context(Some(&json!(ten))).unwrap().len(), 10);

        let eleven: Vec<Value> = (0..11).map(|i| turn(&format!("q{i}"), &format!("a{i}"))).collect();
        let err = v.validate_context(Some(&json!(eleven))).unwrap_err();
        assert_eq!(err, ValidationError::TooMany { limit: 10, actual: 11 });
        assert_eq!(err.kind(), "too_many");
    }

    #[test]
    fn test_context_item_missing_answer_is_invalid() {
        let v = RequestValidator::default();
        let raw = json!([turn("q0", "a0"), { "question": "q1" }]);
        let err = v.validate_context(Some(&raw)).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(err.field(), "context[1]");
    }

    #[test]
    fn test_context_item_wrong_shape_is_invalid() {
        let v = RequestValidator::default();
        for raw in [json!(["just a string"]), json!([{ "question": 1, "answer": "a" }])] {
            assert_eq!(v.validate_context(Some(&raw)).unwrap_err().kind(), "invalid_input");
        }
    }

    #[test]
    fn test_context_item_length_enforced_per_field() {
        let v = RequestValidator::default();
        let raw = json!([turn("fine", &"x".repeat(1001))]);
        let err = v.validate_context(Some(&raw)).unwrap_err();
        assert_eq!(err, ValidationError::TooLong { field: "context[0].answer".into(), limit: 1000 });

        let raw = json!([turn(&"x".repeat(1000), &"y".repeat(1000))]);
        assert!(v.validate_context(Some(&raw)).is_ok());
    }

    #[test]
    fn test_context_preserves_order_and_trims() {
        let v = RequestValidator::default();
        let raw = json!([turn("  first q ", " first a  "), turn("second q", "second a")]);
        let ctx = v.validate_context(Some(&raw)).unwrap();
        assert_eq!(ctx.turns()[0].question(), "first q");
        assert_eq!(ctx.turns()[0].answer(), "first a");
        assert_eq!(ctx.turns()[1].question(), "second q");
    }

    #[test]
    fn test_custom_limits() {
        let v = RequestValidator::new(ValidationLimits {
            max_question_length: 5,
            max_context_items: 1,
            max_context_item_length: 3,
        });
        assert!(v.validate_question(Some(&json!("hello"))).is_ok());
        assert_eq!(v.validate_question(Some(&json!("hello!"))).unwrap_err().kind(), "too_long");
        assert_eq!(
            v.validate_context(Some(&json!([turn("a", "b"), turn("c", "d")]))).unwrap_err().kind(),
            "too_many"
        );
    }
}
