//! Configuration Module
//!
//! Provider catalog and engine settings.

pub mod loader;
pub mod provider;

pub use loader::ConfigLoader;
pub use provider::{
    EngineConfig, KeyrelayConfig, Provider, ProviderConfig, ProviderRegistry, WireFormat,
};
