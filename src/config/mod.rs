// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Gateway configuration.
//!
//! Resolution order, later wins:
//! 1. built-in defaults
//! 2. JSON config file (`--config`, or `~/.config/askgate/config.json`)
//! 3. environment variables
//!
//! Every section uses `#[serde(default)]`, so a config file only needs the
//! keys it changes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::guardrail::SubjectProfile;
use crate::prompt::{default_system_prompt, DEFAULT_BACKGROUND_INFO};
use crate::ratelimit::RateLimitSettings;
use crate::upstream::UpstreamSettings;
use crate::validate::ValidationLimits;

pub const CONFIG_FILE_NAME: &str = "config.json";

pub const DEFAULT_BIND: &str = "0.0.0.0";

pub const DEFAULT_PORT: u16 = 3000;

/// Request body ceiling (128 KiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {name}: {reason}")]
    Env { name: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    /// Browser origins allowed to call the API. Empty allows any.
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            allowed_origins: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerSettings,
    pub subject: SubjectProfile,
    pub upstream: UpstreamSettings,
    pub rate_limit: RateLimitSettings,
    pub limits: ValidationLimits,
    /// Facts about the subject handed to the model as context.
    pub background_info: String,
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            subject: SubjectProfile::default(),
            upstream: UpstreamSettings::default(),
            rate_limit: RateLimitSettings::default(),
            limits: ValidationLimits::default(),
            background_info: DEFAULT_BACKGROUND_INFO.to_string(),
            system_prompt: None,
        }
    }
}

/// `~/.config/askgate/config.json` (platform equivalent elsewhere).
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("askgate").join(CONFIG_FILE_NAME))
}

impl GatewayConfig {
    /// Load, apply environment overrides, and validate.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read the config file.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used if present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_path().filter(|p| p.exists()) {
                Some(p) => p,
                None => {
                    tracing::debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

        tracing::info!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Blank values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BACKGROUND_INFO") {
            self.background_info = v;
        }
        if let Some(v) = get("SYSTEM_PROMPT") {
            self.system_prompt = Some(v);
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.upstream.api_key = Some(v.trim().to_string());
        }
        if let Some(v) = get("MODERATION_API_KEY") {
            self.upstream.moderation_api_key = Some(v.trim().to_string());
        }
        if let Some(v) = get("SUBJECT_NAME") {
            self.subject.name = v.trim().to_string();
        }
        if let Some(v) = get("ALLOWED_ORIGINS") {
            self.server.allowed_origins = v
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("PORT") {
            self.server.port = v.trim().parse().map_err(|e| ConfigError::Env {
                name: "PORT",
                reason: format!("{e}"),
            })?;
        }
        Ok(())
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.rate_limit.window_ms == 0 {
            return invalid("rate_limit.window_ms must be greater than zero");
        }
        if self.rate_limit.max_requests == 0 {
            return invalid("rate_limit.max_requests must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.rate_limit.sweep_probability) {
            return invalid("rate_limit.sweep_probability must be between 0 and 1");
        }
        if self.upstream.timeout_secs == 0 {
            return invalid("upstream.timeout_secs must be greater than zero");
        }
        if !(0.0..=2.0).contains(&self.upstream.temperature) {
            return invalid("upstream.temperature must be between 0 and 2");
        }
        if self.upstream.max_tokens == 0 {
            return invalid("upstream.max_tokens must be greater than zero");
        }
        if self.subject.name.trim().is_empty() {
            return invalid("subject.name must not be empty");
        }
        if self.limits.max_question_length == 0 || self.limits.max_context_item_length == 0 {
            return invalid("limits must be greater than zero");
        }
        if self.server.max_body_bytes == 0 {
            return invalid("server.max_body_bytes must be greater than zero");
        }
        Ok(())
    }

    /// Configured system prompt, or the built-in one for this subject.
    pub fn effective_system_prompt(&self) -> String {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_system_prompt(self.subject.name.trim()))
    }

    /// Log the effective settings with secrets masked.
    pub fn log_summary(&self) {
        tracing::info!(
            bind = %self.server.bind,
            port = self.server.port,
            subject = %self.subject.name,
            model = %self.upstream.model,
            api_key = %self.upstream.api_key.as_deref().map(|k| mask_sensitive(k, 6)).unwrap_or_else(|| "<unset>".to_string()),
            moderation = self.upstream.moderation_api_key.is_some(),
            allowed_origins = ?self.server.allowed_origins,
            window_ms = self.rate_limit.window_ms,
            max_requests = self.rate_limit.max_requests,
            "Gateway configuration"
        );
    }
}

/// Mask a sensitive string (like API keys) for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest with "...".
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.chars().count() <= visible_prefix {
        // Still masked, so the length does not leak
        return "...".to_string();
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.max_body_bytes, 128 * 1024);
        assert_eq!(config.background_info, "No information provided.");
        assert_eq!(config.subject.name, "Shrihari");
        assert_eq!(config.rate_limit.max_requests, 60);
        assert_eq!(config.limits.max_question_length, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(r#"{ "subject": { "name": "Ada", "aliases": ["Lovelace"] }, "rate_limit": { "max_requests": 5 } }"#);
        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.subject.name, "Ada");
        assert_eq!(config.subject.aliases, vec!["Lovelace".to_string()]);
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window_ms, 600_000);
        assert_eq!(config.upstream.max_tokens, 300);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = GatewayConfig::load(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let file = write_config("{ not json");
        let err = GatewayConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        config
            .apply_env_from(env(&[
                ("BACKGROUND_INFO", "Builds distributed systems."),
                ("SYSTEM_PROMPT", "Be brief."),
                ("OPENAI_API_KEY", " sk-test "),
                ("MODERATION_API_KEY", "sk-mod"),
                ("ALLOWED_ORIGINS", "https://a.dev, ,https://b.dev"),
                ("SUBJECT_NAME", "Ada"),
                ("PORT", "8080"),
            ]))
            .unwrap();

        assert_eq!(config.background_info, "Builds distributed systems.");
        assert_eq!(config.effective_system_prompt(), "Be brief.");
        assert_eq!(config.upstream.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.upstream.moderation_api_key.as_deref(), Some("sk-mod"));
        assert_eq!(config.server.allowed_origins, vec!["https://a.dev", "https://b.dev"]);
        assert_eq!(config.subject.name, "Ada");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_blank_env_values_ignored() {
        let mut config = GatewayConfig::default();
        config.apply_env_from(env(&[("BACKGROUND_INFO", "   "), ("PORT", "")])).unwrap();
        assert_eq!(config.background_info, DEFAULT_BACKGROUND_INFO);
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn test_bad_port_env() {
        let mut config = GatewayConfig::default();
        let err = config.apply_env_from(env(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "PORT", .. }));
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let cases: Vec<fn(&mut GatewayConfig)> = vec![
            |c| c.rate_limit.window_ms = 0,
            |c| c.rate_limit.max_requests = 0,
            |c| c.rate_limit.sweep_probability = 1.5,
            |c| c.rate_limit.sweep_probability = f64::NAN,
            |c| c.upstream.timeout_secs = 0,
            |c| c.upstream.temperature = -0.1,
            |c| c.subject.name = "  ".into(),
            |c| c.server.max_body_bytes = 0,
        ];
        for mutate in cases {
            let mut config = GatewayConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_default_system_prompt_follows_subject() {
        let mut config = GatewayConfig::default();
        config.subject.name = "Ada".into();
        assert!(config.effective_system_prompt().contains("Ada"));

        config.system_prompt = Some("   ".into());
        assert!(config.effective_system_prompt().contains("Ada"));
    }

    #[test]
    fn test_mask_sensitive() {
        assert_eq!(mask_sensitive("sk-proj-secret123", 6), "sk-pro...");
        assert_eq!(mask_sensitive("short", 8), "...");
        assert_eq!(mask_sensitive("", 8), "...");
    }

    #[test]
    fn test_default_path_location() {
        if let Some(path) = default_path() {
            assert!(path.ends_with("askgate/config.json"));
        }
    }
}
