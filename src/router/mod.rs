//! Router Module
//!
//! Picks which of a user's keys to try for a provider and keeps their usage
//! counters honest.

pub mod selector;
pub mod usage;

pub use selector::{KeySelector, Selection};
pub use usage::UsageTracker;
