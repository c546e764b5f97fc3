// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Prompt construction for the upstream model.
//!
//! Output is deterministic for a given configuration and request:
//! system prompt, background, prior turns (oldest first), current question.

use crate::types::Message;
use crate::validate::{ValidatedContext, ValidatedQuestion};

/// Background text used when none is configured.
pub const DEFAULT_BACKGROUND_INFO: &str = "No information provided.";

/// System prompt used when no override is configured.
pub fn default_system_prompt(subject: &str) -> String {
    format!(
        "You are a friendly assistant on {subject}'s personal website. \
         Answer visitors' questions about {subject} using only the background information provided. \
         If the answer is not in the background information, say you don't know and suggest contacting {subject} directly. \
         Keep answers concise, professional, and in English."
    )
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
    background_info: String,
}

impl PromptBuilder {
    pub fn new(system_prompt: impl Into<String>, background_info: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            background_info: background_info.into(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn background_info(&self) -> &str {
        &self.background_info
    }

    /// Build the message sequence for one request.
    pub fn build(&self, context: &ValidatedContext, question: &ValidatedQuestion) -> Vec<Message> {
        let mut messages = Vec::with_capacity(3 + context.len() * 2);
        messages.push(Message::system(self.system_prompt.as_str()));
        messages.push(Message::system(format!("Background information:\n{}", self.background_info)));

        for turn in context.turns() {
            messages.push(Message::user(turn.question()));
            messages.push(Message::assistant(turn.answer()));
        }

        messages.push(Message::user(question.as_str()));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use crate::validate::RequestValidator;
    use serde_json::json;

    fn inputs(question: &str, context: serde_json::Value) -> (ValidatedContext, ValidatedQuestion) {
        let v = RequestValidator::default();
        (
            v.validate_context(Some(&context)).unwrap(),
            v.validate_question(Some(&json!(question))).unwrap(),
        )
    }

    #[test]
    fn test_build_without_context() {
        let builder = PromptBuilder::new("SYS", DEFAULT_BACKGROUND_INFO);
        let (ctx, q) = inputs("What are his skills?", json!([]));
        let messages = builder.build(&ctx, &q);

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::system("SYS"));
        assert_eq!(messages[1].role, Role::System);
        assert!(messages[1].content.contains(DEFAULT_BACKGROUND_INFO));
        assert_eq!(messages[2], Message::user("What are his skills?"));
    }

    #[test]
    fn test_context_expands_to_ordered_pairs() {
        let builder = PromptBuilder::new("SYS", "Rust developer.");
        let (ctx, q) = inputs(
            "And now?",
            json!([
                { "question": "q1", "answer": "a1" },
                { "question": "q2", "answer": "a2" }
            ]),
        );
        let messages = builder.build(&ctx, &q);

        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(messages[2].content, "q1");
        assert_eq!(messages[3].content, "a1");
        assert_eq!(messages[4].content, "q2");
        assert_eq!(messages[5].content, "a2");
        assert_eq!(messages[6].content, "And now?");
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = PromptBuilder::new(default_system_prompt("Shrihari"), "bg");
        let (ctx, q) = inputs("hello", json!([{ "question": "a", "answer": "b" }]));
        assert_eq!(builder.build(&ctx, &q), builder.build(&ctx, &q));
    }

    #[test]
    fn test_default_system_prompt_names_subject() {
        let prompt = default_system_prompt("Ada");
        assert!(prompt.contains("Ada's personal website"));
        assert!(!prompt.contains("{subject}"));
    }
}
