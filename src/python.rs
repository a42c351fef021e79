//! Python bindings

use crate::engine::{EnhanceRequest, Enhancement};
use crate::error::KeyrelayError;
use crate::{logging, KeyRelay, Provider};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use std::sync::Arc;

/// Python wrapper around [`KeyRelay`]
#[pyclass(name = "KeyRelay")]
struct PyKeyRelay {
    inner: Arc<KeyRelay>,
    runtime: tokio::runtime::Runtime,
}

#[pymethods]
impl PyKeyRelay {
    #[new]
    #[pyo3(signature = (database_url, config_path=None))]
    fn new(database_url: &str, config_path: Option<&str>) -> PyResult<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();
        logging::init("keyrelay=info");

        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| KeyrelayError::Internal(format!("Failed to create runtime: {}", e)))?;

        let inner = runtime.block_on(async {
            match config_path {
                Some(path) => KeyRelay::with_config_path(database_url, path).await,
                None => KeyRelay::connect(database_url).await,
            }
        })?;

        Ok(Self {
            inner: Arc::new(inner),
            runtime,
        })
    }

    /// Enhance `prompt`, falling back to `template` when no provider delivers
    #[pyo3(signature = (user_id, prompt, template, provider=None, key_id=None))]
    fn enhance(
        &self,
        py: Python<'_>,
        user_id: &str,
        prompt: &str,
        template: &str,
        provider: Option<&str>,
        key_id: Option<i64>,
    ) -> PyResult<Py<PyAny>> {
        let mut request = EnhanceRequest::new(user_id, prompt, template);
        if let Some(name) = provider {
            request = request.with_provider(name.parse::<Provider>()?);
        }
        if let Some(id) = key_id {
            request = request.with_pinned_key(id);
        }

        let relay = self.inner.clone();
        let enhancement = self
            .runtime
            .block_on(async move { relay.enhance(request).await })?;

        to_dict(py, &enhancement)
    }

    /// Supported providers, in fallback order
    fn providers(&self) -> Vec<String> {
        self.inner.providers()
    }

    fn provider_info(&self, py: Python<'_>, name: &str) -> PyResult<Py<PyAny>> {
        let info = self.inner.provider_info(name)?;
        let dict = PyDict::new(py);
        dict.set_item("name", &info.name)?;
        dict.set_item("display_name", &info.display_name)?;
        dict.set_item("base_url", &info.base_url)?;
        dict.set_item("default_model", &info.default_model)?;
        dict.set_item("models", &info.models)?;
        dict.set_item("default_daily_limit", info.default_daily_limit)?;
        Ok(dict.into())
    }
}

fn to_dict(py: Python<'_>, enhancement: &Enhancement) -> PyResult<Py<PyAny>> {
    let dict = PyDict::new(py);
    dict.set_item("ai_enhanced", enhancement.ai_enhanced)?;
    dict.set_item("text", &enhancement.text)?;
    dict.set_item("provider", enhancement.provider.map(|p| p.as_str()))?;
    dict.set_item("key_id", enhancement.key_id)?;
    dict.set_item("reason", enhancement.reason.map(|r| r.as_str()))?;

    let attempts = PyList::empty(py);
    for attempt in &enhancement.attempts {
        let item = PyDict::new(py);
        item.set_item("provider", attempt.provider.as_str())?;
        item.set_item("key_id", attempt.key_id)?;
        item.set_item("outcome", attempt.outcome.as_str())?;
        item.set_item("latency_ms", attempt.latency.as_millis() as u64)?;
        item.set_item("at", attempt.at.to_rfc3339())?;
        attempts.append(item)?;
    }
    dict.set_item("attempts", attempts)?;

    Ok(dict.into())
}

/// Python module definition
#[pymodule]
fn _keyrelay(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyKeyRelay>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
