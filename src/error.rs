//! Keyrelay Error Types
//!
//! Errors that escape the engine. Per-key and per-provider failures are
//! absorbed by the orchestrator; only configuration, storage and fatal
//! request errors reach the caller.

use crate::config::Provider;
use thiserror::Error;

/// Main error type for keyrelay operations
#[derive(Debug, Error)]
pub enum KeyrelayError {
    /// Configuration errors (invalid JSON, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider id is not one of the supported providers
    #[error("Provider '{0}' is not supported. Supported providers: groq, openai, anthropic, gemini")]
    ProviderNotFound(String),

    /// Credential store could not be reached or rejected a query
    #[error("Credential store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A key id that should exist does not
    #[error("API key {0} not found")]
    KeyNotFound(i64),

    /// A key with the same (user, provider, key_name) already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The request itself was rejected as malformed; retrying other keys
    /// or providers would not help
    #[error("Request rejected by '{provider}': {message}")]
    Fatal { provider: Provider, message: String },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for KeyrelayError {
    fn from(err: serde_json::Error) -> Self {
        KeyrelayError::Config(format!("JSON parsing error: {}", err))
    }
}

impl From<std::io::Error> for KeyrelayError {
    fn from(err: std::io::Error) -> Self {
        KeyrelayError::Config(format!("IO error: {}", err))
    }
}

#[cfg(feature = "python")]
impl From<KeyrelayError> for pyo3::PyErr {
    fn from(err: KeyrelayError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyConnectionError, PyRuntimeError, PyValueError};

        let msg = err.to_string();
        match &err {
            KeyrelayError::Config(_) => PyValueError::new_err(msg),
            KeyrelayError::ProviderNotFound(_) => PyValueError::new_err(msg),
            KeyrelayError::KeyNotFound(_) => PyValueError::new_err(msg),
            KeyrelayError::Conflict(_) => PyValueError::new_err(msg),
            KeyrelayError::Fatal { .. } => PyValueError::new_err(msg),
            KeyrelayError::Store(_) => PyConnectionError::new_err(msg),
            KeyrelayError::Internal(_) => PyRuntimeError::new_err(msg),
        }
    }
}

/// Result type alias for keyrelay operations
pub type Result<T> = std::result::Result<T, KeyrelayError>;
