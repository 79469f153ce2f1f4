//! Chat completions endpoint and agent runtime configuration.

use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

/// OpenAI-compatible chat endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChatConfig {
    /// Whether the chat completions endpoint is mounted.
    pub enabled: bool,
    /// Path prefix for the `/v1/chat/completions` and `/v1/models` routes.
    pub path: String,
    /// The agent runtime serving the endpoint.
    pub runtime: RuntimeConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/".to_string(),
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Agent runtime selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum RuntimeConfig {
    /// Runtime backed by an OpenAI-compatible chat model with per-session memory.
    Openai(OpenAiRuntimeConfig),
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::Openai(OpenAiRuntimeConfig::default())
    }
}

/// Settings for the OpenAI-compatible runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiRuntimeConfig {
    /// Base URL of the upstream API, without the `/chat/completions` suffix.
    pub base_url: String,
    /// API key sent as a bearer token. Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<SecretString>,
    /// Upstream model. The model named in each request is only echoed back to the caller.
    pub model: String,
    /// System prompt prepended to every upstream call.
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    /// Upper bound for a single upstream call.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub timeout: Duration,
    /// Sliding window of messages kept per session.
    pub max_messages: usize,
    /// Project identifier reported with every run.
    pub project_id: String,
}

impl Default for OpenAiRuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
            temperature: None,
            timeout: Duration::from_secs(600),
            // 20 conversation turns
            max_messages: 40,
            project_id: "local".to_string(),
        }
    }
}
