//! Provider Configuration
//!
//! The closed set of supported providers and the configuration schema that
//! describes each of them.

use crate::error::{KeyrelayError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A supported AI text-completion provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Groq,
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
}

/// How a provider expects requests to be shaped on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `POST {base}/chat/completions` with a bearer token
    OpenAiCompatible,
    /// `POST {base}/messages` with `x-api-key`
    Anthropic,
    /// `POST {base}/models/{model}:generateContent` with `x-goog-api-key`
    Gemini,
}

impl Provider {
    /// Every provider, in canonical fallback order
    pub const ALL: [Provider; 4] = [
        Provider::Groq,
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Groq => "groq",
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
        }
    }

    pub fn wire_format(&self) -> WireFormat {
        match self {
            Provider::Groq | Provider::OpenAi => WireFormat::OpenAiCompatible,
            Provider::Anthropic => WireFormat::Anthropic,
            Provider::Gemini => WireFormat::Gemini,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = KeyrelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(Provider::Groq),
            "openai" => Ok(Provider::OpenAi),
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "gemini" | "google" => Ok(Provider::Gemini),
            _ => Err(KeyrelayError::ProviderNotFound(s.to_string())),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyrelayConfig {
    /// Provider configurations keyed by provider id
    #[serde(default)]
    pub providers: HashMap<Provider, ProviderConfig>,

    /// Dispatch and batching knobs
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Configuration for a single provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Human-readable name
    pub display_name: String,

    /// Base URL for the API
    pub base_url: String,

    /// Optional environment variable overriding `base_url`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_env: Option<String>,

    /// Model used when a key has no model preference
    pub default_model: String,

    /// Supported models
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Daily quota assigned to new keys
    pub default_daily_limit: i64,

    /// Length of the quota window and of the rate-limit cool-down
    #[serde(default = "default_reset_window_hours")]
    pub reset_window_hours: u32,

    /// Additional headers to send with requests
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

fn default_reset_window_hours() -> u32 {
    24
}

impl ProviderConfig {
    /// Get the effective base URL (from env var if configured, otherwise default)
    pub fn get_base_url(&self) -> String {
        if let Some(env_var) = &self.api_base_env {
            if let Ok(url) = std::env::var(env_var) {
                return url;
            }
        }
        self.base_url.clone()
    }

    pub fn reset_window(&self) -> Duration {
        Duration::hours(i64::from(self.reset_window_hours))
    }

    /// Whether `model` is listed for this provider. An empty list accepts anything.
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

/// Dispatch and batching settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Timeout for a single provider call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Upper bound on keys tried per provider in one run
    #[serde(default = "default_max_keys_per_provider")]
    pub max_keys_per_provider: usize,

    /// Items at the head of a batch that may use AI enhancement
    #[serde(default = "default_batch_ai_cap")]
    pub batch_ai_cap: usize,

    /// Enhancement requests in flight at once within a batch
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_max_keys_per_provider() -> usize {
    3
}

fn default_batch_ai_cap() -> usize {
    5
}

fn default_batch_concurrency() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_keys_per_provider: default_max_keys_per_provider(),
            batch_ai_cap: default_batch_ai_cap(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

/// Immutable provider descriptors, built once at start-up
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<Provider, ProviderConfig>,
}

impl ProviderRegistry {
    /// Build a registry. Every supported provider must be described.
    pub fn new(providers: HashMap<Provider, ProviderConfig>) -> Result<Self> {
        if let Some(missing) = Provider::ALL.iter().find(|p| !providers.contains_key(p)) {
            return Err(KeyrelayError::Config(format!(
                "No configuration for provider '{}'",
                missing
            )));
        }
        Ok(Self { providers })
    }

    pub fn from_config(config: &KeyrelayConfig) -> Result<Self> {
        Self::new(config.providers.clone())
    }

    pub fn get(&self, provider: Provider) -> Result<&ProviderConfig> {
        self.providers
            .get(&provider)
            .ok_or_else(|| KeyrelayError::ProviderNotFound(provider.to_string()))
    }

    /// Cool-down and quota window for a provider
    pub fn reset_window(&self, provider: Provider) -> Duration {
        self.providers
            .get(&provider)
            .map(ProviderConfig::reset_window)
            .unwrap_or_else(|| Duration::hours(i64::from(default_reset_window_hours())))
    }

    /// Model to call with: the key's preference when supported, else the default
    pub fn resolve_model(&self, provider: Provider, preference: Option<&str>) -> Result<String> {
        let config = self.get(provider)?;
        match preference {
            Some(model) if !model.is_empty() && config.supports_model(model) => {
                Ok(model.to_string())
            }
            _ => Ok(config.default_model.clone()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Provider, &ProviderConfig)> {
        Provider::ALL
            .into_iter()
            .filter_map(|p| self.providers.get(&p).map(|c| (p, c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(models: Vec<&str>) -> ProviderConfig {
        ProviderConfig {
            display_name: "Example".to_string(),
            base_url: "https://api.example.com/v1".to_string(),
            api_base_env: None,
            default_model: "base-model".to_string(),
            models: models.into_iter().map(String::from).collect(),
            default_daily_limit: 100,
            reset_window_hours: 6,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_provider_round_trips_through_str() {
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>().unwrap(), p);
        }
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert!("cohere".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_serde_ids() {
        assert_eq!(serde_json::to_string(&Provider::OpenAi).unwrap(), "\"openai\"");
        let p: Provider = serde_json::from_str("\"groq\"").unwrap();
        assert_eq!(p, Provider::Groq);
    }

    #[test]
    fn test_deserialize_provider_config() {
        let json = r#"{
            "display_name": "Groq",
            "base_url": "https://api.groq.com/openai/v1",
            "default_model": "llama-3.1-8b-instant",
            "models": ["llama-3.1-8b-instant"],
            "default_daily_limit": 1000
        }"#;

        let config: ProviderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.reset_window_hours, 24);
        assert_eq!(config.reset_window(), Duration::hours(24));
        assert!(config.headers.is_empty());
    }

    #[test]
    fn test_engine_defaults() {
        let engine: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(engine, EngineConfig::default());
        assert_eq!(engine.request_timeout(), std::time::Duration::from_secs(15));
        assert_eq!(engine.max_keys_per_provider, 3);
        assert_eq!(engine.batch_ai_cap, 5);
    }

    #[test]
    fn test_registry_requires_every_provider() {
        let mut providers = HashMap::new();
        providers.insert(Provider::Groq, sample(vec![]));
        assert!(ProviderRegistry::new(providers).is_err());
    }

    #[test]
    fn test_resolve_model_falls_back_to_default() {
        let providers = Provider::ALL
            .into_iter()
            .map(|p| (p, sample(vec!["base-model", "big-model"])))
            .collect();
        let registry = ProviderRegistry::new(providers).unwrap();

        assert_eq!(
            registry.resolve_model(Provider::Groq, Some("big-model")).unwrap(),
            "big-model"
        );
        assert_eq!(
            registry.resolve_model(Provider::Groq, Some("unknown")).unwrap(),
            "base-model"
        );
        assert_eq!(
            registry.resolve_model(Provider::Groq, None).unwrap(),
            "base-model"
        );
        assert_eq!(registry.reset_window(Provider::Gemini), Duration::hours(6));
    }
}
