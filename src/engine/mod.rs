//! Engine Module
//!
//! Classification, dispatch, provider fallback and batching.

pub mod batch;
pub mod classifier;
pub mod dispatcher;
pub mod orchestrator;

pub use batch::BatchEnhancer;
pub use classifier::{classify, OutcomeKind, RateLimitClassifier};
pub use dispatcher::{Dispatch, DispatchAttempt, ProviderDispatcher};
pub use orchestrator::{
    priority_order, EnhanceRequest, Enhancement, FallbackOrchestrator, UnenhancedReason,
};
