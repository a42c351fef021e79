//! Usage accounting
//!
//! Quota is charged when a call is claimed, never when it finishes, and is
//! never refunded. Success only stamps `last_used_at`.

use crate::clock::Clock;
use crate::error::Result;
use crate::store::{ApiKeyRecord, ClaimOutcome, CredentialStore};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct UsageTracker {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Apply a lazily due quota reset, returning the up-to-date record
    pub async fn refresh(&self, record: ApiKeyRecord) -> Result<ApiKeyRecord> {
        let now = self.clock.now();
        if !record.reset_due(now) {
            return Ok(record);
        }
        let refreshed = self.store.reset_if_due(&record, now).await?;
        debug!(
            key_id = refreshed.id,
            next_reset = %refreshed.daily_reset_at,
            "quota window reset"
        );
        Ok(refreshed)
    }

    /// Reserve one unit of quota on `record`
    pub async fn charge(&self, record: &ApiKeyRecord) -> Result<ClaimOutcome> {
        self.store.claim(record.id, self.clock.now()).await
    }

    pub async fn record_success(&self, record: &ApiKeyRecord) -> Result<()> {
        self.store.record_use(record.id, self.clock.now()).await
    }
}
