//! Provider dispatch
//!
//! Works through a queue of ranked keys for one provider until one claim is
//! granted, then makes exactly one call with it.

use crate::client::{ProviderClients, ProviderError};
use crate::clock::Clock;
use crate::config::{Provider, ProviderRegistry};
use crate::engine::classifier::{OutcomeKind, RateLimitClassifier};
use crate::error::{KeyrelayError, Result};
use crate::router::UsageTracker;
use crate::store::{ApiKeyRecord, ClaimOutcome, KeyId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Record of one granted attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchAttempt {
    pub provider: Provider,
    pub key_id: KeyId,
    pub outcome: OutcomeKind,
    pub latency: Duration,
    pub at: DateTime<Utc>,
}

/// A finished call: the key that made it and what came back
#[derive(Debug)]
pub struct Dispatch {
    pub record: ApiKeyRecord,
    pub result: std::result::Result<String, ProviderError>,
    pub attempt: DispatchAttempt,
}

impl Dispatch {
    pub fn outcome(&self) -> OutcomeKind {
        self.attempt.outcome
    }
}

#[derive(Clone)]
pub struct ProviderDispatcher {
    clients: ProviderClients,
    usage: UsageTracker,
    classifier: RateLimitClassifier,
    registry: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl ProviderDispatcher {
    pub fn new(
        clients: ProviderClients,
        usage: UsageTracker,
        classifier: RateLimitClassifier,
        registry: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            clients,
            usage,
            classifier,
            registry,
            clock,
            timeout,
        }
    }

    /// Claim the first grantable key in `candidates` and call `provider` with it.
    ///
    /// Denied claims are skipped without a network call. Returns `None` once
    /// the queue runs dry. Never retries.
    pub async fn dispatch(
        &self,
        provider: Provider,
        candidates: &mut VecDeque<ApiKeyRecord>,
        prompt: &str,
    ) -> Result<Option<Dispatch>> {
        let client = self.clients.get(provider).ok_or_else(|| {
            KeyrelayError::Internal(format!("no client registered for {}", provider))
        })?;

        while let Some(candidate) = candidates.pop_front() {
            let record = match self.usage.charge(&candidate).await? {
                ClaimOutcome::Granted(record) => record,
                ClaimOutcome::Denied => {
                    debug!(key_id = candidate.id, %provider, "claim denied");
                    continue;
                }
            };

            let model = self
                .registry
                .resolve_model(provider, record.model_preference.as_deref())?;

            let started = Instant::now();
            let result =
                match tokio::time::timeout(self.timeout, client.complete(&record.secret, &model, prompt))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(format!(
                        "no response within {}s",
                        self.timeout.as_secs_f32()
                    ))),
                };
            let latency = started.elapsed();

            let outcome = self.classifier.classify(provider, &result);
            skip_removed_key(self.classifier.apply(outcome, &record).await, provider)?;

            match (&outcome, &result) {
                (OutcomeKind::Success, _) => {
                    skip_removed_key(self.usage.record_success(&record).await, provider)?;
                    info!(key_id = record.id, %provider, %model, ?latency, "call succeeded");
                }
                (_, Err(err)) => {
                    warn!(key_id = record.id, %provider, %outcome, error = %err, "call failed");
                }
                (_, Ok(_)) => {
                    warn!(key_id = record.id, %provider, %outcome, "call returned no text");
                }
            }

            let attempt = DispatchAttempt {
                provider,
                key_id: record.id,
                outcome,
                latency,
                at: self.clock.now(),
            };
            return Ok(Some(Dispatch {
                record,
                result,
                attempt,
            }));
        }

        Ok(None)
    }
}

/// A key deleted while its call was in flight has nothing left to update
fn skip_removed_key(result: Result<()>, provider: Provider) -> Result<()> {
    match result {
        Err(KeyrelayError::KeyNotFound(id)) => {
            warn!(key_id = id, %provider, "key removed during call, bookkeeping skipped");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{CredentialStore, InMemoryCredentialStore, NewApiKey};
    use crate::test_utils::{registry, t0, ScriptedClient};
    use async_trait::async_trait;

    struct Fixture {
        store: Arc<InMemoryCredentialStore>,
        dispatcher: ProviderDispatcher,
    }

    fn fixture(client: Arc<ScriptedClient>, timeout: Duration) -> Fixture {
        let store = Arc::new(InMemoryCredentialStore::new(registry()));
        let dispatcher = dispatcher(store.clone(), client, timeout);
        Fixture { store, dispatcher }
    }

    fn dispatcher(
        store: Arc<dyn CredentialStore>,
        client: Arc<ScriptedClient>,
        timeout: Duration,
    ) -> ProviderDispatcher {
        let registry = registry();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(t0()));
        let usage = UsageTracker::new(store.clone(), clock.clone());
        let classifier = RateLimitClassifier::new(store.clone(), clock.clone());
        ProviderDispatcher::new(
            ProviderClients::new().with(client),
            usage,
            classifier,
            registry,
            clock,
            timeout,
        )
    }

    /// Grants claims, then fails every later write to the key
    struct FailsAfterClaim {
        inner: InMemoryCredentialStore,
        error: fn(KeyId) -> KeyrelayError,
    }

    #[async_trait]
    impl CredentialStore for FailsAfterClaim {
        async fn insert(&self, key: NewApiKey, now: DateTime<Utc>) -> Result<ApiKeyRecord> {
            self.inner.insert(key, now).await
        }

        async fn get(&self, id: KeyId) -> Result<Option<ApiKeyRecord>> {
            self.inner.get(id).await
        }

        async fn list_eligible(
            &self,
            user_id: &str,
            provider: Provider,
            pinned: Option<KeyId>,
        ) -> Result<Vec<ApiKeyRecord>> {
            self.inner.list_eligible(user_id, provider, pinned).await
        }

        async fn first_active(
            &self,
            user_id: &str,
            provider: Provider,
        ) -> Result<Option<ApiKeyRecord>> {
            self.inner.first_active(user_id, provider).await
        }

        async fn claim(&self, id: KeyId, now: DateTime<Utc>) -> Result<ClaimOutcome> {
            self.inner.claim(id, now).await
        }

        async fn mark_rate_limited(
            &self,
            id: KeyId,
            _provider: Provider,
            _now: DateTime<Utc>,
        ) -> Result<()> {
            Err((self.error)(id))
        }

        async fn clear_rate_limit(&self, id: KeyId, now: DateTime<Utc>) -> Result<()> {
            self.inner.clear_rate_limit(id, now).await
        }

        async fn mark_invalid(&self, id: KeyId) -> Result<()> {
            Err((self.error)(id))
        }

        async fn reset_if_due(
            &self,
            record: &ApiKeyRecord,
            now: DateTime<Utc>,
        ) -> Result<ApiKeyRecord> {
            self.inner.reset_if_due(record, now).await
        }

        async fn record_use(&self, id: KeyId, _now: DateTime<Utc>) -> Result<()> {
            Err((self.error)(id))
        }
    }

    async fn failing_store(
        error: fn(KeyId) -> KeyrelayError,
    ) -> (Arc<FailsAfterClaim>, ApiKeyRecord) {
        let store = Arc::new(FailsAfterClaim {
            inner: InMemoryCredentialStore::new(registry()),
            error,
        });
        let record = key(&store.inner, "a", 10).await;
        (store, record)
    }

    async fn key(store: &InMemoryCredentialStore, name: &str, limit: i64) -> ApiKeyRecord {
        store
            .insert(
                NewApiKey::new("u1", Provider::Groq, name, format!("gsk_{name}")).with_daily_limit(limit),
                t0(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_the_charge() {
        let client = ScriptedClient::new(Provider::Groq)
            .then_status(503, "overloaded")
            .shared();
        let f = fixture(client.clone(), Duration::from_secs(5));
        let a = key(&f.store, "a", 10).await;

        let mut queue = VecDeque::from(vec![a.clone()]);
        let dispatch = f
            .dispatcher
            .dispatch(Provider::Groq, &mut queue, "intro")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dispatch.outcome(), OutcomeKind::Transient);
        assert_eq!(client.calls(), 1);

        let stored = f.store.get(a.id).await.unwrap().unwrap();
        assert_eq!(stored.usage_count, 1);
        assert_eq!(stored.last_used_at, None);
    }

    #[tokio::test]
    async fn test_denied_claim_moves_on_without_calling() {
        let client = ScriptedClient::new(Provider::Groq).shared();
        let f = fixture(client.clone(), Duration::from_secs(5));
        let spent = key(&f.store, "spent", 1).await;
        let fresh = key(&f.store, "fresh", 10).await;

        // another worker takes the last unit after ranking
        assert!(f.store.claim(spent.id, t0()).await.unwrap().is_granted());

        let mut queue = VecDeque::from(vec![spent, fresh.clone()]);
        let dispatch = f
            .dispatcher
            .dispatch(Provider::Groq, &mut queue, "intro")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dispatch.record.id, fresh.id);
        assert_eq!(dispatch.outcome(), OutcomeKind::Success);
        assert_eq!(client.seen_keys(), vec!["gsk_fresh".to_string()]);
        assert!(queue.is_empty());

        let stored = f.store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(stored.last_used_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_empty_queue_yields_none() {
        let client = ScriptedClient::new(Provider::Groq).shared();
        let f = fixture(client.clone(), Duration::from_secs(5));

        let mut queue = VecDeque::new();
        let dispatch = f
            .dispatcher
            .dispatch(Provider::Groq, &mut queue, "intro")
            .await
            .unwrap();
        assert!(dispatch.is_none());
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out_as_transient() {
        let client = ScriptedClient::new(Provider::Groq)
            .with_delay(Duration::from_millis(500))
            .shared();
        let f = fixture(client, Duration::from_millis(20));
        let a = key(&f.store, "a", 10).await;

        let mut queue = VecDeque::from(vec![a]);
        let dispatch = f
            .dispatcher
            .dispatch(Provider::Groq, &mut queue, "intro")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dispatch.outcome(), OutcomeKind::Transient);
        assert!(matches!(dispatch.result, Err(ProviderError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_missing_client_is_an_error() {
        let client = ScriptedClient::new(Provider::Groq).shared();
        let f = fixture(client, Duration::from_secs(5));

        let mut queue = VecDeque::new();
        let err = f
            .dispatcher
            .dispatch(Provider::Gemini, &mut queue, "intro")
            .await
            .unwrap_err();
        assert!(matches!(err, KeyrelayError::Internal(_)));
    }

    #[tokio::test]
    async fn test_key_removed_mid_call_keeps_the_completion() {
        let (store, record) = failing_store(KeyrelayError::KeyNotFound).await;
        let client = ScriptedClient::new(Provider::Groq).shared();
        let dispatcher = dispatcher(store, client, Duration::from_secs(5));

        let mut queue = VecDeque::from(vec![record.clone()]);
        let dispatch = dispatcher
            .dispatch(Provider::Groq, &mut queue, "intro")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dispatch.record.id, record.id);
        assert_eq!(dispatch.outcome(), OutcomeKind::Success);
        assert_eq!(dispatch.result, Ok("enhanced by groq".to_string()));
    }

    #[tokio::test]
    async fn test_key_removed_before_rate_limit_mark() {
        let (store, record) = failing_store(KeyrelayError::KeyNotFound).await;
        let client = ScriptedClient::new(Provider::Groq)
            .then_status(429, "Rate limit reached")
            .shared();
        let dispatcher = dispatcher(store, client, Duration::from_secs(5));

        let mut queue = VecDeque::from(vec![record]);
        let dispatch = dispatcher
            .dispatch(Provider::Groq, &mut queue, "intro")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dispatch.outcome(), OutcomeKind::RateLimited);
    }

    #[tokio::test]
    async fn test_store_failure_after_call_propagates() {
        let (store, record) =
            failing_store(|_| KeyrelayError::Store(sqlx::Error::PoolClosed)).await;
        let client = ScriptedClient::new(Provider::Groq).shared();
        let dispatcher = dispatcher(store, client, Duration::from_secs(5));

        let mut queue = VecDeque::from(vec![record]);
        let err = dispatcher
            .dispatch(Provider::Groq, &mut queue, "intro")
            .await
            .unwrap_err();
        assert!(matches!(err, KeyrelayError::Store(_)));
    }
}
