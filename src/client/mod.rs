//! Client Module
//!
//! One [`ProviderClient`] per provider behind a uniform interface. The
//! engine never looks at wire formats; it only sees text or a
//! [`ProviderError`].

pub mod anthropic;
pub mod gemini;
pub mod http;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use http::HttpClient;
pub use openai::OpenAiCompatibleClient;

use crate::config::{Provider, ProviderRegistry, WireFormat};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Raw failure of a provider call, before classification
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// No answer within the deadline
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Connection refused, reset, DNS failure and the like
    #[error("Network error: {0}")]
    Network(String),

    /// 2xx but the body was unparsable or carried no text
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The key itself cannot be put on the wire
    #[error("Unusable credential: {0}")]
    InvalidCredential(String),

    /// The request could not even be built or encoded
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProviderError::Network(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            ProviderError::Malformed(format!("Failed to decode response: {}", err))
        } else if err.is_builder() {
            ProviderError::InvalidRequest(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// A text-completion provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Send `prompt` to `model` authenticated with `api_key`; return the reply text
    async fn complete(&self, api_key: &str, model: &str, prompt: &str)
        -> Result<String, ProviderError>;
}

/// The set of clients available to the dispatcher, keyed by provider
#[derive(Clone, Default)]
pub struct ProviderClients {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl ProviderClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP clients for every configured provider
    pub fn from_registry(
        registry: &ProviderRegistry,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = HttpClient::new(timeout)?;
        let mut clients = Self::new();

        for (provider, config) in registry.iter() {
            let client: Arc<dyn ProviderClient> = match provider.wire_format() {
                WireFormat::OpenAiCompatible => {
                    Arc::new(OpenAiCompatibleClient::new(provider, config, http.clone()))
                }
                WireFormat::Anthropic => Arc::new(AnthropicClient::new(config, http.clone())),
                WireFormat::Gemini => Arc::new(GeminiClient::new(config, http.clone())),
            };
            clients.insert(client);
        }

        Ok(clients)
    }

    /// Register a client, replacing any previous one for the same provider
    pub fn insert(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.provider(), client);
    }

    pub fn with(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.insert(client);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<&Arc<dyn ProviderClient>> {
        self.clients.get(&provider)
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.clients.contains_key(&provider)
    }
}
