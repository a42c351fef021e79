//! Key selection
//!
//! Produces the ordered list of keys worth trying for one provider. Keys in
//! a rate-limit cool-down or out of quota are dropped; the rest are ranked
//! by remaining headroom so that load spreads towards the keys with the
//! most quota left.

use crate::clock::Clock;
use crate::config::{Provider, ProviderRegistry};
use crate::error::Result;
use crate::router::UsageTracker;
use crate::store::{ApiKeyRecord, CredentialStore, KeyId};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// How candidates for a provider are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Every rotating key of the provider, ranked
    Rotate,
    /// Only this key
    Pinned(KeyId),
    /// The provider's lowest-id active key, rotating or not
    Fixed,
}

#[derive(Clone)]
pub struct KeySelector {
    store: Arc<dyn CredentialStore>,
    usage: UsageTracker,
    registry: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
}

impl KeySelector {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        usage: UsageTracker,
        registry: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            usage,
            registry,
            clock,
        }
    }

    /// Usable keys of `user_id` for `provider`, best first.
    ///
    /// An empty result means the provider is exhausted for this user.
    pub async fn rank(
        &self,
        user_id: &str,
        provider: Provider,
        selection: Selection,
    ) -> Result<Vec<ApiKeyRecord>> {
        let fetched = match selection {
            Selection::Rotate => self.store.list_eligible(user_id, provider, None).await?,
            Selection::Pinned(id) => self.store.list_eligible(user_id, provider, Some(id)).await?,
            Selection::Fixed => self
                .store
                .first_active(user_id, provider)
                .await?
                .into_iter()
                .collect(),
        };

        let window = self.registry.reset_window(provider);
        let mut candidates = Vec::with_capacity(fetched.len());

        for record in fetched {
            let mut record = self.usage.refresh(record).await?;
            let now = self.clock.now();

            if record.cooldown_elapsed(now, window) {
                self.store.clear_rate_limit(record.id, now).await?;
                record.rate_limit_hit_at = None;
                debug!(key_id = record.id, %provider, "rate-limit cool-down over");
            }

            if record.in_cooldown(now, window) {
                debug!(key_id = record.id, %provider, "skipping key in cool-down");
                continue;
            }
            if record.is_exhausted() {
                debug!(key_id = record.id, %provider, "skipping key out of quota");
                continue;
            }
            candidates.push(record);
        }

        if selection == Selection::Rotate {
            rank_candidates(&mut candidates);
        }

        debug!(
            user_id,
            %provider,
            candidates = ?candidates.iter().map(|r| r.id).collect::<Vec<_>>(),
            "ranked keys"
        );
        Ok(candidates)
    }
}

/// Most headroom first, then least recently used (never used first), then id
fn rank_candidates(candidates: &mut [ApiKeyRecord]) {
    candidates.sort_by(compare);
}

fn compare(a: &ApiKeyRecord, b: &ApiKeyRecord) -> Ordering {
    b.headroom()
        .cmp(&a.headroom())
        .then_with(|| a.last_used_at.cmp(&b.last_used_at))
        .then_with(|| a.id.cmp(&b.id))
}
