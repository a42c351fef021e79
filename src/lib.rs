//! Keyrelay - credential rotation and quota-aware dispatch for AI enhancement
//!
//! Users bring their own API keys for several text-completion providers.
//! Keyrelay picks which key to spend on each request, charges its daily
//! quota atomically, cools down keys the provider throttles, retires keys
//! the provider rejects, and falls back across providers. When nothing
//! works the caller's template comes back untouched.

use std::sync::Arc;

pub mod api;
pub mod client;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod router;
pub mod store;

#[cfg(feature = "python")]
mod python;

#[cfg(test)]
mod test_utils;

pub use client::{ProviderClient, ProviderClients, ProviderError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigLoader, EngineConfig, Provider, ProviderRegistry};
pub use engine::{
    BatchEnhancer, DispatchAttempt, EnhanceRequest, Enhancement, FallbackOrchestrator,
    OutcomeKind, UnenhancedReason,
};
pub use error::{KeyrelayError, Result};
pub use store::{
    ApiKeyRecord, CredentialStore, KeyId, NewApiKey, PreferencesStore, SqliteCredentialStore,
    UserAiPreferences,
};

/// Provider information
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub display_name: String,
    pub base_url: String,
    pub default_model: String,
    pub models: Vec<String>,
    pub default_daily_limit: i64,
}

/// Fully wired engine on top of a SQLite credential store
pub struct KeyRelay {
    registry: Arc<ProviderRegistry>,
    store: Arc<SqliteCredentialStore>,
    orchestrator: Arc<FallbackOrchestrator>,
    batch: BatchEnhancer,
}

impl KeyRelay {
    /// Connect using the default configuration search path
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::from_loader(database_url, ConfigLoader::new()?).await
    }

    /// Connect using the built-in configuration plus the file at `path`
    pub async fn with_config_path(database_url: &str, path: &str) -> Result<Self> {
        Self::from_loader(database_url, ConfigLoader::from_path(path)?).await
    }

    async fn from_loader(database_url: &str, loader: ConfigLoader) -> Result<Self> {
        let config = loader.into_config();
        let registry = Arc::new(ProviderRegistry::from_config(&config)?);
        let store = Arc::new(SqliteCredentialStore::connect(database_url, registry.clone()).await?);
        let clients = ProviderClients::from_registry(&registry, config.engine.request_timeout())
            .map_err(|e| KeyrelayError::Internal(e.to_string()))?;

        let orchestrator = Arc::new(FallbackOrchestrator::new(
            store.clone(),
            store.clone(),
            clients,
            registry.clone(),
            &config.engine,
        ));
        let batch = BatchEnhancer::new(orchestrator.clone(), &config.engine);

        Ok(Self {
            registry,
            store,
            orchestrator,
            batch,
        })
    }

    pub async fn enhance(&self, request: EnhanceRequest) -> Result<Enhancement> {
        self.orchestrator.enhance(request).await
    }

    pub async fn enhance_batch(&self, requests: Vec<EnhanceRequest>) -> Vec<Result<Enhancement>> {
        self.batch.enhance_batch(requests).await
    }

    /// The underlying store, for the key-management surface
    pub fn store(&self) -> &SqliteCredentialStore {
        &self.store
    }

    /// Supported providers, in fallback order
    pub fn providers(&self) -> Vec<String> {
        self.registry.iter().map(|(p, _)| p.to_string()).collect()
    }

    pub fn provider_info(&self, name: &str) -> Result<ProviderInfo> {
        let provider: Provider = name.parse()?;
        let config = self.registry.get(provider)?;
        Ok(ProviderInfo {
            name: provider.to_string(),
            display_name: config.display_name.clone(),
            base_url: config.get_base_url(),
            default_model: config.default_model.clone(),
            models: config.models.clone(),
            default_daily_limit: config.default_daily_limit,
        })
    }
}
