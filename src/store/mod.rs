//! Credential Store
//!
//! Persisted API keys with quota and rate-limit metadata, plus per-user AI
//! preferences. The store is the only shared mutable state in the engine;
//! every concurrent caller coordinates through [`CredentialStore::claim`].

use crate::config::Provider;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryCredentialStore;
pub use sqlite::SqliteCredentialStore;

/// Primary key of an API key record
pub type KeyId = i64;

/// A user-supplied credential for one provider
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: KeyId,
    pub user_id: String,
    pub provider: Provider,
    pub key_name: String,
    #[serde(skip_serializing, default)]
    pub secret: String,
    pub model_preference: Option<String>,

    /// User/administrative toggle. Once cleared by the engine it stays cleared.
    pub is_active: bool,

    /// Participates in automatic selection
    pub enable_rotation: bool,

    /// Calls claimed since the last quota reset
    pub usage_count: i64,
    pub daily_limit: i64,
    pub last_used_at: Option<DateTime<Utc>>,

    /// Next quota reset instant
    pub daily_reset_at: DateTime<Utc>,

    /// Set when the provider rejected a call as rate limited
    pub rate_limit_hit_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// Quota units left in the current window
    pub fn headroom(&self) -> i64 {
        (self.daily_limit - self.usage_count).max(0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.usage_count >= self.daily_limit
    }

    /// Still serving a rate-limit cool-down of length `window`
    pub fn in_cooldown(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.rate_limit_hit_at.is_some_and(|hit| now < hit + window)
    }

    /// Flagged as rate limited but the cool-down has elapsed
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.rate_limit_hit_at.is_some_and(|hit| now >= hit + window)
    }

    pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.daily_reset_at
    }

    /// First reset instant strictly after `now`, stepping by whole windows
    pub fn next_reset_after(&self, now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
        if window <= Duration::zero() {
            return now + Duration::hours(24);
        }
        let next = self.daily_reset_at;
        if next > now {
            return next;
        }
        let behind = (now - next).num_milliseconds();
        let steps = behind / window.num_milliseconds() + 1;
        next + Duration::milliseconds(window.num_milliseconds() * steps)
    }

    /// Secret with everything but the last four characters hidden
    pub fn masked_secret(&self) -> String {
        mask_secret(&self.secret)
    }
}

impl fmt::Debug for ApiKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyRecord")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("key_name", &self.key_name)
            .field("secret", &self.masked_secret())
            .field("model_preference", &self.model_preference)
            .field("is_active", &self.is_active)
            .field("enable_rotation", &self.enable_rotation)
            .field("usage_count", &self.usage_count)
            .field("daily_limit", &self.daily_limit)
            .field("last_used_at", &self.last_used_at)
            .field("daily_reset_at", &self.daily_reset_at)
            .field("rate_limit_hit_at", &self.rate_limit_hit_at)
            .finish_non_exhaustive()
    }
}

pub(crate) fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

/// Fields supplied by the key-management surface when adding a key
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub user_id: String,
    pub provider: Provider,
    pub key_name: String,
    pub secret: String,
    pub model_preference: Option<String>,
    pub enable_rotation: bool,

    /// Falls back to the provider's default daily limit
    pub daily_limit: Option<i64>,
    pub notes: Option<String>,
}

impl NewApiKey {
    pub fn new(
        user_id: impl Into<String>,
        provider: Provider,
        key_name: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
            key_name: key_name.into(),
            secret: secret.into(),
            model_preference: None,
            enable_rotation: true,
            daily_limit: None,
            notes: None,
        }
    }

    pub fn with_daily_limit(mut self, limit: i64) -> Self {
        self.daily_limit = Some(limit);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_preference = Some(model.into());
        self
    }

    pub fn with_rotation(mut self, enable_rotation: bool) -> Self {
        self.enable_rotation = enable_rotation;
        self
    }
}

/// Result of an atomic quota claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// One unit of quota was reserved; the record reflects the new count
    Granted(ApiKeyRecord),
    /// The key is inactive, out of quota, cooling down, or gone
    Denied,
}

impl ClaimOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimOutcome::Granted(_))
    }
}

/// Durable storage for API keys
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Add a key. The first quota window starts at `now`.
    async fn insert(&self, key: NewApiKey, now: DateTime<Utc>) -> Result<ApiKeyRecord>;

    async fn get(&self, id: KeyId) -> Result<Option<ApiKeyRecord>>;

    /// Active keys of `user_id` for `provider` that could serve a call.
    ///
    /// Without `pinned`, only rotating keys are returned, ordered by id. With
    /// `pinned`, only that key is returned, and only if it belongs to
    /// (`user_id`, `provider`) and is active.
    async fn list_eligible(
        &self,
        user_id: &str,
        provider: Provider,
        pinned: Option<KeyId>,
    ) -> Result<Vec<ApiKeyRecord>>;

    /// Lowest-id active key of `user_id` for `provider`, rotating or not
    async fn first_active(&self, user_id: &str, provider: Provider)
        -> Result<Option<ApiKeyRecord>>;

    /// Reserve one unit of quota.
    ///
    /// A single conditional read-modify-write: the increment only lands if, at
    /// update time, the key is active, below its daily limit, and outside its
    /// rate-limit cool-down. A due quota reset is applied first.
    async fn claim(&self, id: KeyId, now: DateTime<Utc>) -> Result<ClaimOutcome>;

    /// Start the provider's cool-down for this key
    async fn mark_rate_limited(&self, id: KeyId, provider: Provider, now: DateTime<Utc>)
        -> Result<()>;

    /// Clear an elapsed rate-limit flag. A flag still inside its window is kept.
    async fn clear_rate_limit(&self, id: KeyId, now: DateTime<Utc>) -> Result<()>;

    /// Deactivate the key permanently
    async fn mark_invalid(&self, id: KeyId) -> Result<()>;

    /// Zero the usage counter and advance the reset instant if it has passed.
    ///
    /// Guarded on the observed `daily_reset_at`, so concurrent callers reset once.
    async fn reset_if_due(&self, record: &ApiKeyRecord, now: DateTime<Utc>)
        -> Result<ApiKeyRecord>;

    /// Stamp `last_used_at` after a successful call
    async fn record_use(&self, id: KeyId, now: DateTime<Utc>) -> Result<()>;
}

/// Per-user AI settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAiPreferences {
    pub user_id: String,
    pub preferred_provider: Provider,
    pub enable_global_rotation: bool,

    /// Permission to try providers other than the preferred one
    pub fallback_enabled: bool,
}

impl UserAiPreferences {
    /// Settings applied the first time a user is seen
    pub fn defaults(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            preferred_provider: Provider::Groq,
            enable_global_rotation: true,
            fallback_enabled: true,
        }
    }
}

/// Read access to user preferences; creates defaults on first read
#[async_trait]
pub trait PreferencesStore: Send + Sync {
    async fn get_or_create(&self, user_id: &str) -> Result<UserAiPreferences>;

    async fn save(&self, prefs: &UserAiPreferences) -> Result<()>;
}
