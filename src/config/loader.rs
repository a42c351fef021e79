//! Configuration Loader
//!
//! Loads the built-in provider catalog and merges overrides from the file system.

use crate::config::provider::{EngineConfig, KeyrelayConfig, Provider, ProviderConfig};
use crate::error::{KeyrelayError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable naming an extra config file
pub const CONFIG_PATH_ENV: &str = "KEYRELAY_CONFIG_PATH";

/// Configuration loader with support for multiple sources
pub struct ConfigLoader {
    config: KeyrelayConfig,
}

/// Override files may omit the engine section; only present keys replace defaults.
#[derive(Debug, Deserialize)]
struct ConfigOverride {
    #[serde(default)]
    providers: HashMap<Provider, ProviderConfig>,
    #[serde(default)]
    engine: Option<EngineConfig>,
}

impl ConfigLoader {
    /// Create a new config loader and load from default locations
    pub fn new() -> Result<Self> {
        let mut loader = Self {
            config: KeyrelayConfig::default(),
        };

        // Load built-in defaults first
        loader.load_builtin_defaults()?;

        // Then load from file system (can override built-ins)
        loader.load_from_default_paths()?;

        Ok(loader)
    }

    /// Create a loader with a specific config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut loader = Self {
            config: KeyrelayConfig::default(),
        };

        loader.load_builtin_defaults()?;
        loader.load_from_file(path)?;

        Ok(loader)
    }

    /// Only the compiled-in catalog, no file system lookups
    pub fn builtin() -> Result<Self> {
        let mut loader = Self {
            config: KeyrelayConfig::default(),
        };
        loader.load_builtin_defaults()?;
        Ok(loader)
    }

    /// Load built-in provider defaults
    fn load_builtin_defaults(&mut self) -> Result<()> {
        let defaults = include_str!("../../providers.json");
        let config: ConfigOverride = serde_json::from_str(defaults).map_err(|e| {
            KeyrelayError::Config(format!("Failed to parse built-in providers.json: {}", e))
        })?;

        self.merge_config(config);
        Ok(())
    }

    /// Load configuration from default paths
    fn load_from_default_paths(&mut self) -> Result<()> {
        for path in Self::get_config_paths() {
            if path.exists() {
                self.load_from_file(&path)?;
            }
        }

        Ok(())
    }

    /// Get list of config paths to check, lowest precedence first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".keyrelay").join("providers.json"));
        }

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("keyrelay").join("providers.json"));
        }

        paths.push(PathBuf::from("keyrelay.json"));

        if let Ok(custom_path) = std::env::var(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(custom_path));
        }

        paths
    }

    /// Load configuration from a specific file
    fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeyrelayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: ConfigOverride = serde_json::from_str(&content).map_err(|e| {
            KeyrelayError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        tracing::debug!(path = %path.display(), "loaded keyrelay config overrides");
        self.merge_config(config);
        Ok(())
    }

    /// Merge another config into this one (later configs override earlier)
    fn merge_config(&mut self, other: ConfigOverride) {
        for (provider, config) in other.providers {
            self.config.providers.insert(provider, config);
        }

        if let Some(engine) = other.engine {
            self.config.engine = engine;
        }
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &KeyrelayConfig {
        &self.config
    }

    /// Take ownership of the configuration
    pub fn into_config(self) -> KeyrelayConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderRegistry;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_builtin_defaults() {
        let loader = ConfigLoader::builtin().unwrap();
        let config = loader.config();
        for provider in Provider::ALL {
            assert!(config.providers.contains_key(&provider), "{provider} missing");
        }
        assert_eq!(config.engine.request_timeout_secs, 15);
        assert!(ProviderRegistry::from_config(config).is_ok());
    }

    #[test]
    fn test_load_from_custom_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "providers": {{
                    "groq": {{
                        "display_name": "Groq (proxy)",
                        "base_url": "https://proxy.internal/groq",
                        "default_model": "llama-3.1-8b-instant",
                        "default_daily_limit": 50,
                        "reset_window_hours": 12
                    }}
                }},
                "engine": {{ "max_keys_per_provider": 2 }}
            }}"#
        )
        .unwrap();

        let loader = ConfigLoader::from_path(file.path()).unwrap();
        let groq = &loader.config().providers[&Provider::Groq];
        assert_eq!(groq.base_url, "https://proxy.internal/groq");
        assert_eq!(groq.reset_window_hours, 12);

        // untouched providers keep their built-in entries
        assert!(loader.config().providers.contains_key(&Provider::Gemini));

        let engine = &loader.config().engine;
        assert_eq!(engine.max_keys_per_provider, 2);
        assert_eq!(engine.request_timeout_secs, 15);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{ not json").unwrap();

        let err = ConfigLoader::from_path(file.path()).err().unwrap();
        assert!(matches!(err, KeyrelayError::Config(ref msg) if msg.contains("Failed to parse")));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{ "providers": {{ "cohere": {{
                "display_name": "Cohere", "base_url": "https://x", "default_model": "m",
                "default_daily_limit": 1 }} }} }}"#
        )
        .unwrap();

        assert!(ConfigLoader::from_path(file.path()).is_err());
    }
}
