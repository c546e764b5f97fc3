// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Admission guardrail - decides whether a question is answerable at all.
//!
//! The assistant only talks about one subject (a person, configured by
//! name). Everything else is redirected with a fixed message, however
//! harmless, and the upstream model is never called for it.
//!
//! The policy is an ordered list of [`GuardrailRule`]s. The first rule whose
//! pattern matches decides the verdict; when none match the question is
//! off-topic. Language rules come first so a non-English question is never
//! let through by an accidental topic match.
//!
//! Classification is pure: no I/O, no randomness. The same text always
//! gets the same verdict.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::validate::ValidatedQuestion;

/// Default subject of the assistant.
pub const DEFAULT_SUBJECT_NAME: &str = "Shrihari";

// ============================================================================
// VERDICTS
// ============================================================================

/// Why a question was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    AboutSubject,
    Greeting,
}

/// Why a question was redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    NonEnglishLanguage,
    OffTopic,
    /// Flagged by the external moderation service, not by a rule here.
    Moderated,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonEnglishLanguage => "non_english_language",
            Self::OffTopic => "off_topic",
            Self::Moderated => "moderated",
        }
    }
}

/// Outcome of classifying one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailVerdict {
    Allowed(AllowReason),
    Blocked { reason: BlockReason, message: String },
}

impl GuardrailVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

// ============================================================================
// SUBJECT
// ============================================================================

/// Who the assistant answers questions about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectProfile {
    /// Display name, also matched case-insensitively in questions.
    pub name: String,
    /// Other names that count as a direct mention (nicknames, surname).
    pub aliases: Vec<String>,
}

impl Default for SubjectProfile {
    fn default() -> Self {
        Self {
            name: DEFAULT_SUBJECT_NAME.to_string(),
            aliases: Vec::new(),
        }
    }
}

// ============================================================================
// RULES
// ============================================================================

/// Which form of the question a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleInput {
    /// Text as validated (trimmed, original case).
    Raw,
    /// Lowercased and trimmed.
    Normalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Allow(AllowReason),
    Block(BlockReason),
}

/// One step of the guardrail policy.
#[derive(Debug, Clone)]
pub struct GuardrailRule {
    name: &'static str,
    input: RuleInput,
    pattern: Regex,
    outcome: RuleOutcome,
}

impl GuardrailRule {
    fn new(name: &'static str, input: RuleInput, pattern: &str, outcome: RuleOutcome) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            input,
            pattern: Regex::new(pattern)?,
            outcome,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn outcome(&self) -> RuleOutcome {
        self.outcome
    }

    pub fn matches(&self, raw: &str, normalized: &str) -> bool {
        match self.input {
            RuleInput::Raw => self.pattern.is_match(raw),
            RuleInput::Normalized => self.pattern.is_match(normalized),
        }
    }
}

/// Devanagari through Malayalam, Arabic, Cyrillic, Thai, kana, CJK, Hangul.
const NON_LATIN_SCRIPTS: &str = r"[\x{0900}-\x{0D7F}\x{0600}-\x{06FF}\x{0400}-\x{04FF}\x{0E00}-\x{0E7F}\x{3040}-\x{30FF}\x{4E00}-\x{9FFF}\x{AC00}-\x{D7AF}]";

/// Romanized Hindi/Urdu words common enough to signal a non-English question.
const TRANSLITERATED_TOKENS: &str =
    r"\b(?:kya|kaise|kaisa|kaun|kyun|kyon|hai|hain|namaste|batao|bataiye|mujhe|aap|tum|nahi|accha|theek)\b";

const PRONOUN_ATTRIBUTE: &str = r"\b(?:his|he|him|your|you)\b.*\b(?:experience|background|skills?|projects?|work|works|worked|contact|e-?mail|resume|cv|portfolio|expertise|achievements?|tech stack|hobbies|interests)\b";

const PRONOUN_WORK_AT_ORG: &str = r"\b(?:he|you)\s+(?:currently\s+)?(?:work|works|worked|working|intern|interned)\s+(?:at|for|with|in)\b|\bwhere\s+(?:does|did|do|has|have)\s+(?:he|you)\s+(?:work|worked|intern)";

const PRONOUN_EDUCATION: &str = r"\b(?:his|your)\s+(?:education|degree|college|university|school|studies|qualifications?|major)\b|\b(?:he|you)\s+(?:study|studied|studying|graduate|graduated|major|majored)\b";

const CONTACT_INTENT: &str =
    r"\bget in touch\b|\b(?:contact|reach|hire|email|message|connect with)\s+(?:him|you)\b|\b(?:his|your)\s+(?:linkedin|github|phone|number)\b";

const DESCRIBE_SUBJECT: &str = r"\b(?:tell me about|describe|who is|introduce)\s+(?:him|himself|he|yourself|you|his|your)\b|\b(?:do you think|think)\s+(?:he|you)\s+(?:is|are|would|could)\b";

const GREETING: &str = r"^(?:hi|hello|hey|greetings|who are you|what do you do)[\s!?.,]*$";

// ============================================================================
// GUARDRAIL
// ============================================================================

/// Ordered rule list plus the redirect messages it hands back.
#[derive(Debug, Clone)]
pub struct AdmissionGuardrail {
    rules: Vec<GuardrailRule>,
    off_topic_message: String,
    non_english_message: String,
    moderated_message: String,
}

impl AdmissionGuardrail {
    /// Build the policy for `subject`.
    pub fn new(subject: &SubjectProfile) -> Result<Self, regex::Error> {
        use RuleInput::{Normalized, Raw};
        use RuleOutcome::{Allow, Block};

        let about = Allow(AllowReason::AboutSubject);
        let rules = vec![
            GuardrailRule::new("non_english_script", Raw, NON_LATIN_SCRIPTS, Block(BlockReason::NonEnglishLanguage))?,
            GuardrailRule::new(
                "transliterated_non_english",
                Normalized,
                TRANSLITERATED_TOKENS,
                Block(BlockReason::NonEnglishLanguage),
            )?,
            GuardrailRule::new("subject_name", Normalized, &name_pattern(subject), about)?,
            GuardrailRule::new("pronoun_attribute", Normalized, PRONOUN_ATTRIBUTE, about)?,
            GuardrailRule::new("pronoun_work_at_org", Normalized, PRONOUN_WORK_AT_ORG, about)?,
            GuardrailRule::new("pronoun_education", Normalized, PRONOUN_EDUCATION, about)?,
            GuardrailRule::new("contact_intent", Normalized, CONTACT_INTENT, about)?,
            GuardrailRule::new("describe_subject", Normalized, DESCRIBE_SUBJECT, about)?,
            GuardrailRule::new("greeting", Normalized, GREETING, Allow(AllowReason::Greeting))?,
        ];

        let name = subject.name.trim();
        Ok(Self {
            rules,
            off_topic_message: format!(
                "I'm here to answer questions about {name}. Try asking about {name}'s experience, projects, skills, or how to get in touch."
            ),
            non_english_message: format!(
                "I can only respond to questions in English. Please ask your question about {name} in English."
            ),
            moderated_message: format!(
                "I can't help with that. Feel free to ask about {name}'s background or work instead."
            ),
        })
    }

    pub fn rules(&self) -> &[GuardrailRule] {
        &self.rules
    }

    /// Classify a validated question.
    pub fn classify(&self, question: &ValidatedQuestion) -> GuardrailVerdict {
        self.classify_text(question.as_str())
    }

    /// Classify arbitrary text. Used by the offline `classify` command.
    pub fn classify_text(&self, text: &str) -> GuardrailVerdict {
        let raw = text.trim();
        let normalized = raw.to_lowercase();

        let outcome = self
            .rules
            .iter()
            .find(|rule| rule.matches(raw, &normalized))
            .map(|rule| {
                tracing::debug!(rule = rule.name(), "Guardrail rule matched");
                rule.outcome()
            })
            .unwrap_or(RuleOutcome::Block(BlockReason::OffTopic));

        match outcome {
            RuleOutcome::Allow(reason) => GuardrailVerdict::Allowed(reason),
            RuleOutcome::Block(reason) => self.blocked(reason),
        }
    }

    /// Verdict carrying the redirect message for `reason`.
    pub fn blocked(&self, reason: BlockReason) -> GuardrailVerdict {
        let message = match reason {
            BlockReason::NonEnglishLanguage => &self.non_english_message,
            BlockReason::OffTopic => &self.off_topic_message,
            BlockReason::Moderated => &self.moderated_message,
        };
        GuardrailVerdict::Blocked {
            reason,
            message: message.clone(),
        }
    }
}

fn name_pattern(subject: &SubjectProfile) -> String {
    let names: Vec<String> = std::iter::once(&subject.name)
        .chain(subject.aliases.iter())
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .map(|n| regex::escape(&n))
        .collect();

    if names.is_empty() {
        // Matches nothing.
        return r"\b\B".to_string();
    }
    format!(r"\b(?:{})\b", names.join("|"))
}
