//! In-memory credential store.
//!
//! Keeps every record behind one lock, so each operation is trivially
//! atomic within the process. Suitable for tests and single-process
//! deployments; state is lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
    ApiKeyRecord, ClaimOutcome, CredentialStore, KeyId, NewApiKey, PreferencesStore,
    UserAiPreferences,
};
use crate::config::{Provider, ProviderRegistry};
use crate::error::{KeyrelayError, Result};

#[derive(Debug, Default)]
struct KeyTable {
    records: BTreeMap<KeyId, ApiKeyRecord>,
    next_id: KeyId,
}

/// In-memory implementation of [`CredentialStore`] and [`PreferencesStore`]
#[derive(Clone)]
pub struct InMemoryCredentialStore {
    registry: Arc<ProviderRegistry>,
    keys: Arc<RwLock<KeyTable>>,
    preferences: Arc<RwLock<HashMap<String, UserAiPreferences>>>,
}

impl InMemoryCredentialStore {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            keys: Arc::new(RwLock::new(KeyTable {
                records: BTreeMap::new(),
                next_id: 1,
            })),
            preferences: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Apply a due reset in place
    fn reset_locked(&self, record: &mut ApiKeyRecord, now: DateTime<Utc>) {
        if record.reset_due(now) {
            let window = self.registry.reset_window(record.provider);
            record.daily_reset_at = record.next_reset_after(now, window);
            record.usage_count = 0;
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn insert(&self, key: NewApiKey, now: DateTime<Utc>) -> Result<ApiKeyRecord> {
        let provider = self.registry.get(key.provider)?;
        let daily_limit = key.daily_limit.unwrap_or(provider.default_daily_limit);
        let window = provider.reset_window();

        let mut table = self.keys.write();
        let duplicate = table.records.values().any(|r| {
            r.user_id == key.user_id && r.provider == key.provider && r.key_name == key.key_name
        });
        if duplicate {
            return Err(KeyrelayError::Conflict(format!(
                "key '{}' already exists for {} on {}",
                key.key_name, key.user_id, key.provider
            )));
        }

        let id = table.next_id;
        table.next_id += 1;

        let record = ApiKeyRecord {
            id,
            user_id: key.user_id,
            provider: key.provider,
            key_name: key.key_name,
            secret: key.secret,
            model_preference: key.model_preference,
            is_active: true,
            enable_rotation: key.enable_rotation,
            usage_count: 0,
            daily_limit,
            last_used_at: None,
            daily_reset_at: now + window,
            rate_limit_hit_at: None,
            notes: key.notes,
            created_at: now,
        };
        table.records.insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: KeyId) -> Result<Option<ApiKeyRecord>> {
        Ok(self.keys.read().records.get(&id).cloned())
    }

    async fn list_eligible(
        &self,
        user_id: &str,
        provider: Provider,
        pinned: Option<KeyId>,
    ) -> Result<Vec<ApiKeyRecord>> {
        let table = self.keys.read();
        let owned = |r: &&ApiKeyRecord| {
            r.user_id == user_id && r.provider == provider && r.is_active && r.daily_limit > 0
        };

        let records = match pinned {
            Some(id) => table.records.get(&id).filter(owned).cloned().into_iter().collect(),
            None => table
                .records
                .values()
                .filter(owned)
                .filter(|r| r.enable_rotation)
                .cloned()
                .collect(),
        };
        Ok(records)
    }

    async fn first_active(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<ApiKeyRecord>> {
        Ok(self
            .keys
            .read()
            .records
            .values()
            .find(|r| r.user_id == user_id && r.provider == provider && r.is_active)
            .cloned())
    }

    async fn claim(&self, id: KeyId, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let mut table = self.keys.write();
        let Some(record) = table.records.get_mut(&id) else {
            return Ok(ClaimOutcome::Denied);
        };

        self.reset_locked(record, now);

        let window = self.registry.reset_window(record.provider);
        if !record.is_active || record.is_exhausted() || record.in_cooldown(now, window) {
            return Ok(ClaimOutcome::Denied);
        }

        record.usage_count += 1;
        Ok(ClaimOutcome::Granted(record.clone()))
    }

    async fn mark_rate_limited(
        &self,
        id: KeyId,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut table = self.keys.write();
        match table.records.get_mut(&id) {
            Some(record) if record.provider == provider => {
                record.rate_limit_hit_at = Some(now);
                Ok(())
            }
            _ => Err(KeyrelayError::KeyNotFound(id)),
        }
    }

    async fn clear_rate_limit(&self, id: KeyId, now: DateTime<Utc>) -> Result<()> {
        let mut table = self.keys.write();
        if let Some(record) = table.records.get_mut(&id) {
            let window = self.registry.reset_window(record.provider);
            if record.cooldown_elapsed(now, window) {
                record.rate_limit_hit_at = None;
            }
        }
        Ok(())
    }

    async fn mark_invalid(&self, id: KeyId) -> Result<()> {
        let mut table = self.keys.write();
        let record = table
            .records
            .get_mut(&id)
            .ok_or(KeyrelayError::KeyNotFound(id))?;
        record.is_active = false;
        Ok(())
    }

    async fn reset_if_due(
        &self,
        record: &ApiKeyRecord,
        now: DateTime<Utc>,
    ) -> Result<ApiKeyRecord> {
        let mut table = self.keys.write();
        let stored = table
            .records
            .get_mut(&record.id)
            .ok_or(KeyrelayError::KeyNotFound(record.id))?;

        // someone else already moved the window on
        if stored.daily_reset_at == record.daily_reset_at {
            self.reset_locked(stored, now);
        }
        Ok(stored.clone())
    }

    async fn record_use(&self, id: KeyId, now: DateTime<Utc>) -> Result<()> {
        let mut table = self.keys.write();
        let record = table
            .records
            .get_mut(&id)
            .ok_or(KeyrelayError::KeyNotFound(id))?;
        record.last_used_at = Some(now);
        Ok(())
    }
}

#[async_trait]
impl PreferencesStore for InMemoryCredentialStore {
    async fn get_or_create(&self, user_id: &str) -> Result<UserAiPreferences> {
        let mut prefs = self.preferences.write();
        Ok(prefs
            .entry(user_id.to_string())
            .or_insert_with(|| UserAiPreferences::defaults(user_id))
            .clone())
    }

    async fn save(&self, prefs: &UserAiPreferences) -> Result<()> {
        self.preferences
            .write()
            .insert(prefs.user_id.clone(), prefs.clone());
        Ok(())
    }
}
