//! SQLite credential store.
//!
//! Every state change is one conditional `UPDATE` whose `WHERE` clause
//! re-checks the stored values, so correctness holds across connections
//! and processes sharing the database file.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;

use super::{
    ApiKeyRecord, ClaimOutcome, CredentialStore, KeyId, NewApiKey, PreferencesStore,
    UserAiPreferences,
};
use crate::config::{Provider, ProviderRegistry};
use crate::error::{KeyrelayError, Result};

const KEY_COLUMNS: &str = "id, user_id, provider, key_name, api_key, model_preference, \
     is_active, enable_rotation, usage_count, daily_limit, last_used_at, daily_reset_at, \
     rate_limit_hit_at, notes, created_at";

/// Timestamps are stored as unix milliseconds so comparisons are numeric
#[derive(Debug, FromRow)]
struct ApiKeyRow {
    id: i64,
    user_id: String,
    provider: String,
    key_name: String,
    api_key: String,
    model_preference: Option<String>,
    is_active: bool,
    enable_rotation: bool,
    usage_count: i64,
    daily_limit: i64,
    last_used_at: Option<i64>,
    daily_reset_at: i64,
    rate_limit_hit_at: Option<i64>,
    notes: Option<String>,
    created_at: i64,
}

impl TryFrom<ApiKeyRow> for ApiKeyRecord {
    type Error = KeyrelayError;

    fn try_from(row: ApiKeyRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            provider: Provider::from_str(&row.provider)?,
            key_name: row.key_name,
            secret: row.api_key,
            model_preference: row.model_preference,
            is_active: row.is_active,
            enable_rotation: row.enable_rotation,
            usage_count: row.usage_count,
            daily_limit: row.daily_limit,
            last_used_at: row.last_used_at.map(from_millis).transpose()?,
            daily_reset_at: from_millis(row.daily_reset_at)?,
            rate_limit_hit_at: row.rate_limit_hit_at.map(from_millis).transpose()?,
            notes: row.notes,
            created_at: from_millis(row.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct PreferencesRow {
    user_id: String,
    preferred_provider: String,
    enable_global_rotation: bool,
    fallback_enabled: bool,
}

impl TryFrom<PreferencesRow> for UserAiPreferences {
    type Error = KeyrelayError;

    fn try_from(row: PreferencesRow) -> Result<Self> {
        Ok(Self {
            user_id: row.user_id,
            preferred_provider: Provider::from_str(&row.preferred_provider)?,
            enable_global_rotation: row.enable_global_rotation,
            fallback_enabled: row.fallback_enabled,
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| KeyrelayError::Internal(format!("timestamp out of range: {}", ms)))
}

fn map_insert_error(err: sqlx::Error, key: &NewApiKey) -> KeyrelayError {
    let unique = err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if unique {
        KeyrelayError::Conflict(format!(
            "key '{}' already exists for {} on {}",
            key.key_name, key.user_id, key.provider
        ))
    } else {
        KeyrelayError::Store(err)
    }
}

/// SQLite-backed [`CredentialStore`] and [`PreferencesStore`]
#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
    registry: Arc<ProviderRegistry>,
}

impl SqliteCredentialStore {
    /// Connect to `database_url` (e.g. `sqlite://keys.db?mode=rwc`) and ensure the schema
    pub async fn connect(database_url: &str, registry: Arc<ProviderRegistry>) -> Result<Self> {
        // every connection to `sqlite::memory:` opens a separate database
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = options.connect(database_url).await?;
        let store = Self::from_pool(pool, registry);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool, registry: Arc<ProviderRegistry>) -> Self {
        Self { pool, registry }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS ai_api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                key_name TEXT NOT NULL,
                api_key TEXT NOT NULL,
                model_preference TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                enable_rotation INTEGER NOT NULL DEFAULT 1,
                usage_count INTEGER NOT NULL DEFAULT 0,
                daily_limit INTEGER NOT NULL,
                last_used_at INTEGER,
                daily_reset_at INTEGER NOT NULL,
                rate_limit_hit_at INTEGER,
                notes TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE (user_id, provider, key_name)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ai_api_keys_user_provider ON ai_api_keys (user_id, provider)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS user_ai_preferences (
                user_id TEXT PRIMARY KEY,
                preferred_provider TEXT NOT NULL,
                enable_global_rotation INTEGER NOT NULL DEFAULT 1,
                fallback_enabled INTEGER NOT NULL DEFAULT 1
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(&self, id: KeyId) -> Result<Option<ApiKeyRecord>> {
        let sql = format!("SELECT {KEY_COLUMNS} FROM ai_api_keys WHERE id = ?");
        sqlx::query_as::<_, ApiKeyRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ApiKeyRecord::try_from)
            .transpose()
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn insert(&self, key: NewApiKey, now: DateTime<Utc>) -> Result<ApiKeyRecord> {
        let provider = self.registry.get(key.provider)?;
        let daily_limit = key.daily_limit.unwrap_or(provider.default_daily_limit);
        let reset_at = now + provider.reset_window();

        let sql = format!(
            r"
            INSERT INTO ai_api_keys
                (user_id, provider, key_name, api_key, model_preference, is_active,
                 enable_rotation, usage_count, daily_limit, daily_reset_at, notes, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?, 0, ?, ?, ?, ?)
            RETURNING {KEY_COLUMNS}
            "
        );
        let row = sqlx::query_as::<_, ApiKeyRow>(&sql)
            .bind(&key.user_id)
            .bind(key.provider.as_str())
            .bind(&key.key_name)
            .bind(&key.secret)
            .bind(&key.model_preference)
            .bind(key.enable_rotation)
            .bind(daily_limit)
            .bind(to_millis(reset_at))
            .bind(&key.notes)
            .bind(to_millis(now))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_insert_error(e, &key))?;

        row.try_into()
    }

    async fn get(&self, id: KeyId) -> Result<Option<ApiKeyRecord>> {
        self.fetch(id).await
    }

    async fn list_eligible(
        &self,
        user_id: &str,
        provider: Provider,
        pinned: Option<KeyId>,
    ) -> Result<Vec<ApiKeyRecord>> {
        let rows = match pinned {
            Some(id) => {
                let sql = format!(
                    "SELECT {KEY_COLUMNS} FROM ai_api_keys \
                     WHERE id = ? AND user_id = ? AND provider = ? AND is_active = 1 AND daily_limit > 0"
                );
                sqlx::query_as::<_, ApiKeyRow>(&sql)
                    .bind(id)
                    .bind(user_id)
                    .bind(provider.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {KEY_COLUMNS} FROM ai_api_keys \
                     WHERE user_id = ? AND provider = ? AND is_active = 1 \
                       AND enable_rotation = 1 AND daily_limit > 0 \
                     ORDER BY id"
                );
                sqlx::query_as::<_, ApiKeyRow>(&sql)
                    .bind(user_id)
                    .bind(provider.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(ApiKeyRecord::try_from).collect()
    }

    async fn first_active(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<ApiKeyRecord>> {
        let sql = format!(
            "SELECT {KEY_COLUMNS} FROM ai_api_keys \
             WHERE user_id = ? AND provider = ? AND is_active = 1 ORDER BY id LIMIT 1"
        );
        sqlx::query_as::<_, ApiKeyRow>(&sql)
            .bind(user_id)
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(ApiKeyRecord::try_from)
            .transpose()
    }

    async fn claim(&self, id: KeyId, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let Some(current) = self.fetch(id).await? else {
            return Ok(ClaimOutcome::Denied);
        };
        if current.reset_due(now) {
            self.reset_if_due(&current, now).await?;
        }

        let window = self.registry.reset_window(current.provider);
        let cooldown_cutoff = now - window;

        // the predicate is evaluated against the row as it is at update time
        let sql = format!(
            r"
            UPDATE ai_api_keys
            SET usage_count = usage_count + 1
            WHERE id = ?
              AND is_active = 1
              AND usage_count < daily_limit
              AND daily_reset_at > ?
              AND (rate_limit_hit_at IS NULL OR rate_limit_hit_at <= ?)
            RETURNING {KEY_COLUMNS}
            "
        );
        let row = sqlx::query_as::<_, ApiKeyRow>(&sql)
            .bind(id)
            .bind(to_millis(now))
            .bind(to_millis(cooldown_cutoff))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(ClaimOutcome::Granted(row.try_into()?)),
            None => Ok(ClaimOutcome::Denied),
        }
    }

    async fn mark_rate_limited(
        &self,
        id: KeyId,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE ai_api_keys SET rate_limit_hit_at = ? WHERE id = ? AND provider = ?",
        )
        .bind(to_millis(now))
        .bind(id)
        .bind(provider.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(KeyrelayError::KeyNotFound(id));
        }
        Ok(())
    }

    async fn clear_rate_limit(&self, id: KeyId, now: DateTime<Utc>) -> Result<()> {
        let Some(current) = self.fetch(id).await? else {
            return Ok(());
        };
        let cutoff = now - self.registry.reset_window(current.provider);

        sqlx::query(
            "UPDATE ai_api_keys SET rate_limit_hit_at = NULL \
             WHERE id = ? AND rate_limit_hit_at IS NOT NULL AND rate_limit_hit_at <= ?",
        )
        .bind(id)
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_invalid(&self, id: KeyId) -> Result<()> {
        let result = sqlx::query("UPDATE ai_api_keys SET is_active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(KeyrelayError::KeyNotFound(id));
        }
        Ok(())
    }

    async fn reset_if_due(
        &self,
        record: &ApiKeyRecord,
        now: DateTime<Utc>,
    ) -> Result<ApiKeyRecord> {
        if record.reset_due(now) {
            let window = self.registry.reset_window(record.provider);
            let next = record.next_reset_after(now, window);

            // guarded on the observed reset instant: a concurrent reset wins once
            sqlx::query(
                "UPDATE ai_api_keys SET usage_count = 0, daily_reset_at = ? \
                 WHERE id = ? AND daily_reset_at = ?",
            )
            .bind(to_millis(next))
            .bind(record.id)
            .bind(to_millis(record.daily_reset_at))
            .execute(&self.pool)
            .await?;
        }

        self.fetch(record.id)
            .await?
            .ok_or(KeyrelayError::KeyNotFound(record.id))
    }

    async fn record_use(&self, id: KeyId, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE ai_api_keys SET last_used_at = ? WHERE id = ?")
            .bind(to_millis(now))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(KeyrelayError::KeyNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl PreferencesStore for SqliteCredentialStore {
    async fn get_or_create(&self, user_id: &str) -> Result<UserAiPreferences> {
        let defaults = UserAiPreferences::defaults(user_id);
        sqlx::query(
            r"
            INSERT INTO user_ai_preferences
                (user_id, preferred_provider, enable_global_rotation, fallback_enabled)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id) DO NOTHING
            ",
        )
        .bind(&defaults.user_id)
        .bind(defaults.preferred_provider.as_str())
        .bind(defaults.enable_global_rotation)
        .bind(defaults.fallback_enabled)
        .execute(&self.pool)
        .await?;

        sqlx::query_as::<_, PreferencesRow>(
            "SELECT user_id, preferred_provider, enable_global_rotation, fallback_enabled \
             FROM user_ai_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    async fn save(&self, prefs: &UserAiPreferences) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO user_ai_preferences
                (user_id, preferred_provider, enable_global_rotation, fallback_enabled)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                preferred_provider = excluded.preferred_provider,
                enable_global_rotation = excluded.enable_global_rotation,
                fallback_enabled = excluded.fallback_enabled
            ",
        )
        .bind(&prefs.user_id)
        .bind(prefs.preferred_provider.as_str())
        .bind(prefs.enable_global_rotation)
        .bind(prefs.fallback_enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
