//! Batch enhancement
//!
//! Runs a list of requests with bounded parallelism. Only the first
//! `batch_ai_cap` items may reach a provider; the rest come back with their
//! template straight away.

use crate::config::EngineConfig;
use crate::engine::orchestrator::{EnhanceRequest, Enhancement, FallbackOrchestrator, UnenhancedReason};
use crate::error::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct BatchEnhancer {
    orchestrator: Arc<FallbackOrchestrator>,
    ai_cap: usize,
    concurrency: usize,
}

impl BatchEnhancer {
    pub fn new(orchestrator: Arc<FallbackOrchestrator>, engine: &EngineConfig) -> Self {
        Self {
            orchestrator,
            ai_cap: engine.batch_ai_cap,
            concurrency: engine.batch_concurrency.max(1),
        }
    }

    /// Results come back in input order
    pub async fn enhance_batch(&self, requests: Vec<EnhanceRequest>) -> Vec<Result<Enhancement>> {
        let total = requests.len();
        if total > self.ai_cap {
            debug!(total, cap = self.ai_cap, "batch exceeds AI allowance");
        }

        stream::iter(requests.into_iter().enumerate())
            .map(|(index, request)| {
                let orchestrator = Arc::clone(&self.orchestrator);
                let within_cap = index < self.ai_cap;
                async move {
                    if within_cap {
                        orchestrator.enhance(request).await
                    } else {
                        Ok(Enhancement::unenhanced(
                            request.template,
                            UnenhancedReason::BatchCapReached,
                            Vec::new(),
                        ))
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }
}
