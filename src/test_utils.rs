//! Shared fixtures for unit tests

use crate::client::{ProviderClient, ProviderError};
use crate::config::{ConfigLoader, Provider, ProviderRegistry};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Registry built from the bundled provider config
pub fn registry() -> Arc<ProviderRegistry> {
    let config = ConfigLoader::builtin().unwrap().into_config();
    Arc::new(ProviderRegistry::from_config(&config).unwrap())
}

/// Fixed start instant for time-dependent tests
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

/// A provider client that replays queued results.
///
/// Once the queue is empty every call answers `Ok(default_text)`.
pub struct ScriptedClient {
    provider: Provider,
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    default_text: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen_keys: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            script: Mutex::new(VecDeque::new()),
            default_text: format!("enhanced by {}", provider),
            delay: None,
            calls: AtomicUsize::new(0),
            seen_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, result: Result<String, ProviderError>) -> Self {
        self.script.lock().push_back(result);
        self
    }

    pub fn then_status(self, status: u16, body: &str) -> Self {
        self.then(Err(ProviderError::Http {
            status,
            body: body.to_string(),
        }))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Secrets of every call, in order
    pub fn seen_keys(&self) -> Vec<String> {
        self.seen_keys.lock().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn complete(
        &self,
        api_key: &str,
        _model: &str,
        _prompt: &str,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_keys.lock().push(api_key.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(self.default_text.clone()))
    }
}
