//! Outcome classification
//!
//! Maps the raw result of one provider call to an [`OutcomeKind`] and
//! applies the key-state side effects that go with it.

use crate::client::ProviderError;
use crate::clock::Clock;
use crate::config::{Provider, WireFormat};
use crate::error::Result;
use crate::store::{ApiKeyRecord, CredentialStore};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Body fragments that mark a quota or rate-limit rejection, lowercase
const QUOTA_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota exceeded",
    "insufficient_quota",
    "resource_exhausted",
    "credit balance",
];

/// Gemini reports a bad key as a 400
const GEMINI_INVALID_KEY_MARKERS: &[&str] = &["api key not valid", "api_key_invalid"];

/// What a single dispatch attempt amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    /// Provider-side throttling or quota; the key cools down
    RateLimited,
    /// Bad, revoked or unauthorized key; the key is deactivated
    InvalidCredential,
    /// Worth trying another key
    Transient,
    /// 2xx without usable text
    MalformedResponse,
    /// The request itself is bad; no other key would fare better
    Fatal,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::RateLimited => "rate_limited",
            OutcomeKind::InvalidCredential => "invalid_credential",
            OutcomeKind::Transient => "transient",
            OutcomeKind::MalformedResponse => "malformed_response",
            OutcomeKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the result of a call to `provider`
pub fn classify(provider: Provider, result: &std::result::Result<String, ProviderError>) -> OutcomeKind {
    match result {
        Ok(text) if !text.trim().is_empty() => OutcomeKind::Success,
        Ok(_) => OutcomeKind::MalformedResponse,
        Err(ProviderError::Malformed(_)) => OutcomeKind::MalformedResponse,
        Err(ProviderError::Timeout(_)) | Err(ProviderError::Network(_)) => OutcomeKind::Transient,
        Err(ProviderError::InvalidCredential(_)) => OutcomeKind::InvalidCredential,
        Err(ProviderError::InvalidRequest(_)) => OutcomeKind::Fatal,
        Err(ProviderError::Http { status, body }) => classify_status(provider, *status, body),
    }
}

fn classify_status(provider: Provider, status: u16, body: &str) -> OutcomeKind {
    let body = body.to_lowercase();
    let mentions = |markers: &[&str]| markers.iter().any(|m| body.contains(m));

    match status {
        429 => OutcomeKind::RateLimited,
        400 | 402 | 403 if mentions(QUOTA_MARKERS) => OutcomeKind::RateLimited,
        402 => OutcomeKind::RateLimited,
        401 | 403 => OutcomeKind::InvalidCredential,
        400 if provider.wire_format() == WireFormat::Gemini
            && mentions(GEMINI_INVALID_KEY_MARKERS) =>
        {
            OutcomeKind::InvalidCredential
        }
        400 | 413 | 422 => OutcomeKind::Fatal,
        _ => OutcomeKind::Transient,
    }
}

/// Applies the store side effects of an outcome
#[derive(Clone)]
pub struct RateLimitClassifier {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimitClassifier {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn classify(
        &self,
        provider: Provider,
        result: &std::result::Result<String, ProviderError>,
    ) -> OutcomeKind {
        classify(provider, result)
    }

    /// Start a cool-down or deactivate the key, depending on `outcome`
    pub async fn apply(&self, outcome: OutcomeKind, record: &ApiKeyRecord) -> Result<()> {
        match outcome {
            OutcomeKind::RateLimited => {
                warn!(
                    key_id = record.id,
                    provider = %record.provider,
                    "key rate limited, cooling down"
                );
                self.store
                    .mark_rate_limited(record.id, record.provider, self.clock.now())
                    .await
            }
            OutcomeKind::InvalidCredential => {
                warn!(
                    key_id = record.id,
                    provider = %record.provider,
                    key = %record.masked_secret(),
                    "key rejected by provider, deactivating"
                );
                self.store.mark_invalid(record.id).await
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{InMemoryCredentialStore, NewApiKey};
    use crate::test_utils::{registry, t0};

    fn http(status: u16, body: &str) -> std::result::Result<String, ProviderError> {
        Err(ProviderError::Http {
            status,
            body: body.to_string(),
        })
    }

    #[test]
    fn test_success_and_malformed() {
        assert_eq!(classify(Provider::Groq, &Ok("Hi".into())), OutcomeKind::Success);
        assert_eq!(
            classify(Provider::Groq, &Ok("   ".into())),
            OutcomeKind::MalformedResponse
        );
        assert_eq!(
            classify(Provider::Anthropic, &Err(ProviderError::Malformed("x".into()))),
            OutcomeKind::MalformedResponse
        );
    }

    #[test]
    fn test_rate_limits() {
        for provider in Provider::ALL {
            assert_eq!(classify(provider, &http(429, "")), OutcomeKind::RateLimited);
        }
        assert_eq!(
            classify(Provider::OpenAi, &http(400, r#"{"error":{"code":"insufficient_quota"}}"#)),
            OutcomeKind::RateLimited
        );
        assert_eq!(
            classify(Provider::Anthropic, &http(400, "Your credit balance is too low")),
            OutcomeKind::RateLimited
        );
        assert_eq!(
            classify(Provider::Gemini, &http(403, "RESOURCE_EXHAUSTED")),
            OutcomeKind::RateLimited
        );
    }

    #[test]
    fn test_invalid_credentials() {
        assert_eq!(
            classify(Provider::Groq, &http(401, "Invalid API Key")),
            OutcomeKind::InvalidCredential
        );
        assert_eq!(
            classify(Provider::OpenAi, &http(403, "forbidden")),
            OutcomeKind::InvalidCredential
        );
        assert_eq!(
            classify(Provider::Gemini, &http(400, "API key not valid. Please pass a valid API key.")),
            OutcomeKind::InvalidCredential
        );
        assert_eq!(
            classify(
                Provider::Groq,
                &Err(ProviderError::InvalidCredential("not a header value".into()))
            ),
            OutcomeKind::InvalidCredential
        );
        // same body from an OpenAI-style provider is just a bad request
        assert_eq!(
            classify(Provider::Groq, &http(400, "API key not valid")),
            OutcomeKind::Fatal
        );
    }

    #[test]
    fn test_fatal_and_transient() {
        assert_eq!(classify(Provider::Groq, &http(400, "bad json")), OutcomeKind::Fatal);
        assert_eq!(classify(Provider::Groq, &http(413, "")), OutcomeKind::Fatal);
        assert_eq!(classify(Provider::Anthropic, &http(422, "")), OutcomeKind::Fatal);
        assert_eq!(
            classify(Provider::Groq, &Err(ProviderError::InvalidRequest("header".into()))),
            OutcomeKind::Fatal
        );

        for status in [404, 408, 409, 500, 502, 503, 529] {
            assert_eq!(classify(Provider::Anthropic, &http(status, "")), OutcomeKind::Transient);
        }
        assert_eq!(
            classify(Provider::Gemini, &Err(ProviderError::Timeout("15s".into()))),
            OutcomeKind::Transient
        );
        assert_eq!(
            classify(Provider::OpenAi, &Err(ProviderError::Network("reset".into()))),
            OutcomeKind::Transient
        );
    }

    #[tokio::test]
    async fn test_apply_side_effects() {
        let store = Arc::new(InMemoryCredentialStore::new(registry()));
        let clock = Arc::new(ManualClock::new(t0()));
        let classifier = RateLimitClassifier::new(store.clone(), clock);

        let limited = store
            .insert(NewApiKey::new("u1", Provider::Groq, "a", "gsk_a"), t0())
            .await
            .unwrap();
        let revoked = store
            .insert(NewApiKey::new("u1", Provider::Groq, "b", "gsk_b"), t0())
            .await
            .unwrap();
        let flaky = store
            .insert(NewApiKey::new("u1", Provider::Groq, "c", "gsk_c"), t0())
            .await
            .unwrap();

        classifier.apply(OutcomeKind::RateLimited, &limited).await.unwrap();
        classifier.apply(OutcomeKind::InvalidCredential, &revoked).await.unwrap();
        classifier.apply(OutcomeKind::Transient, &flaky).await.unwrap();

        let limited = store.get(limited.id).await.unwrap().unwrap();
        assert_eq!(limited.rate_limit_hit_at, Some(t0()));
        assert!(limited.is_active);

        let revoked = store.get(revoked.id).await.unwrap().unwrap();
        assert!(!revoked.is_active);
        assert_eq!(revoked.rate_limit_hit_at, None);

        let flaky = store.get(flaky.id).await.unwrap().unwrap();
        assert!(flaky.is_active);
        assert_eq!(flaky.rate_limit_hit_at, None);
    }
}
