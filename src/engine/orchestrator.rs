//! Fallback orchestration
//!
//! Drives one enhancement request across providers: the preferred (or
//! overridden) provider first, then, if the user allows it, the remaining
//! providers in canonical order. Every key-level failure is absorbed; the
//! caller gets either enhanced text or its own template back.

use crate::client::ProviderClients;
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, Provider, ProviderRegistry};
use crate::engine::classifier::{OutcomeKind, RateLimitClassifier};
use crate::engine::dispatcher::{DispatchAttempt, ProviderDispatcher};
use crate::error::{KeyrelayError, Result};
use crate::router::{KeySelector, Selection, UsageTracker};
use crate::store::{CredentialStore, KeyId, PreferencesStore};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// One piece of content to enhance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhanceRequest {
    pub user_id: String,
    pub prompt: String,

    /// Returned unchanged when no provider produces text
    pub template: String,

    /// Replaces the user's preferred provider at the head of the order
    pub provider_override: Option<Provider>,

    /// Use exactly this key on its provider
    pub pinned_key: Option<KeyId>,
}

impl EnhanceRequest {
    pub fn new(
        user_id: impl Into<String>,
        prompt: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            prompt: prompt.into(),
            template: template.into(),
            provider_override: None,
            pinned_key: None,
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider_override = Some(provider);
        self
    }

    pub fn with_pinned_key(mut self, key_id: KeyId) -> Self {
        self.pinned_key = Some(key_id);
        self
    }
}

/// Why the template came back untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnenhancedReason {
    /// No provider in the order had a usable key
    NoEligibleKeys,
    /// Keys were tried and none produced text
    AllAttemptsFailed,
    /// The item fell outside a batch's AI allowance
    BatchCapReached,
}

impl UnenhancedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnenhancedReason::NoEligibleKeys => "no_eligible_keys",
            UnenhancedReason::AllAttemptsFailed => "all_attempts_failed",
            UnenhancedReason::BatchCapReached => "batch_cap_reached",
        }
    }
}

impl fmt::Display for UnenhancedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an enhancement run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enhancement {
    pub ai_enhanced: bool,
    pub text: String,
    pub provider: Option<Provider>,
    pub key_id: Option<KeyId>,
    pub reason: Option<UnenhancedReason>,
    pub attempts: Vec<DispatchAttempt>,
}

impl Enhancement {
    pub fn success(
        provider: Provider,
        key_id: KeyId,
        text: String,
        attempts: Vec<DispatchAttempt>,
    ) -> Self {
        Self {
            ai_enhanced: true,
            text,
            provider: Some(provider),
            key_id: Some(key_id),
            reason: None,
            attempts,
        }
    }

    pub fn unenhanced(
        template: String,
        reason: UnenhancedReason,
        attempts: Vec<DispatchAttempt>,
    ) -> Self {
        Self {
            ai_enhanced: false,
            text: template,
            provider: None,
            key_id: None,
            reason: Some(reason),
            attempts,
        }
    }
}

/// Providers to try, in order
pub fn priority_order(head: Provider, fallback_enabled: bool) -> Vec<Provider> {
    let mut order = vec![head];
    if fallback_enabled {
        order.extend(Provider::ALL.into_iter().filter(|p| *p != head));
    }
    order
}

pub struct FallbackOrchestrator {
    store: Arc<dyn CredentialStore>,
    preferences: Arc<dyn PreferencesStore>,
    clients: ProviderClients,
    selector: KeySelector,
    dispatcher: ProviderDispatcher,
    max_keys_per_provider: usize,
}

impl FallbackOrchestrator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        preferences: Arc<dyn PreferencesStore>,
        clients: ProviderClients,
        registry: Arc<ProviderRegistry>,
        engine: &EngineConfig,
    ) -> Self {
        Self::with_clock(
            store,
            preferences,
            clients,
            registry,
            engine,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        store: Arc<dyn CredentialStore>,
        preferences: Arc<dyn PreferencesStore>,
        clients: ProviderClients,
        registry: Arc<ProviderRegistry>,
        engine: &EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let usage = UsageTracker::new(store.clone(), clock.clone());
        let classifier = RateLimitClassifier::new(store.clone(), clock.clone());
        let selector = KeySelector::new(store.clone(), usage.clone(), registry.clone(), clock.clone());
        let dispatcher = ProviderDispatcher::new(
            clients.clone(),
            usage,
            classifier,
            registry,
            clock,
            engine.request_timeout(),
        );

        Self {
            store,
            preferences,
            clients,
            selector,
            dispatcher,
            max_keys_per_provider: engine.max_keys_per_provider.max(1),
        }
    }

    /// Enhance one piece of content.
    ///
    /// Only a fatal request error or a collaborator failure is an `Err`;
    /// running out of keys or providers yields the template unenhanced.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn enhance(&self, request: EnhanceRequest) -> Result<Enhancement> {
        let prefs = self.preferences.get_or_create(&request.user_id).await?;

        let pinned = match request.pinned_key {
            Some(key_id) => {
                let record = self
                    .store
                    .get(key_id)
                    .await?
                    .filter(|r| r.user_id == request.user_id)
                    .ok_or(KeyrelayError::KeyNotFound(key_id))?;
                Some((record.provider, key_id))
            }
            None => None,
        };

        let head = match pinned {
            Some((provider, _)) => provider,
            None => request.provider_override.unwrap_or(prefs.preferred_provider),
        };
        let order = priority_order(head, prefs.fallback_enabled);
        debug!(?order, "provider order");

        let mut attempts: Vec<DispatchAttempt> = Vec::new();

        for provider in order {
            if !self.clients.contains(provider) {
                warn!(%provider, "no client configured, skipping provider");
                continue;
            }

            let selection = match pinned {
                Some((pinned_provider, key_id)) if pinned_provider == provider => {
                    Selection::Pinned(key_id)
                }
                _ if !prefs.enable_global_rotation => Selection::Fixed,
                _ => Selection::Rotate,
            };

            let ranked = self
                .selector
                .rank(&request.user_id, provider, selection)
                .await?;
            if ranked.is_empty() {
                debug!(%provider, "no eligible keys");
                continue;
            }

            let budget = self.max_keys_per_provider.min(ranked.len());
            let mut queue = VecDeque::from(ranked);
            let mut granted = 0;

            while granted < budget {
                let Some(dispatch) = self
                    .dispatcher
                    .dispatch(provider, &mut queue, &request.prompt)
                    .await?
                else {
                    break;
                };
                granted += 1;
                attempts.push(dispatch.attempt.clone());

                match (dispatch.outcome(), dispatch.result) {
                    (OutcomeKind::Success, Ok(text)) => {
                        info!(
                            %provider,
                            key_id = dispatch.record.id,
                            attempts = attempts.len(),
                            "content enhanced"
                        );
                        return Ok(Enhancement::success(
                            provider,
                            dispatch.record.id,
                            text,
                            attempts,
                        ));
                    }
                    (OutcomeKind::Fatal, result) => {
                        let message = match result {
                            Err(err) => err.to_string(),
                            Ok(_) => "request rejected".to_string(),
                        };
                        error!(%provider, key_id = dispatch.record.id, %message, "aborting run");
                        return Err(KeyrelayError::Fatal { provider, message });
                    }
                    _ => {}
                }
            }

            info!(%provider, tried = granted, "provider exhausted, falling back");
        }

        let reason = if attempts.is_empty() {
            UnenhancedReason::NoEligibleKeys
        } else {
            UnenhancedReason::AllAttemptsFailed
        };
        info!(%reason, attempts = attempts.len(), "returning template unenhanced");
        Ok(Enhancement::unenhanced(request.template, reason, attempts))
    }
}
