//! HTTP Client
//!
//! Thin wrapper over `reqwest` that sends one JSON request and turns every
//! failure into a [`ProviderError`]. No retries happen here; moving on to
//! another key is the orchestrator's job.

use crate::client::ProviderError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Bodies longer than this are cut before they end up in errors and logs
const MAX_ERROR_BODY: usize = 500;

/// Shared HTTP client
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a new HTTP client. `timeout` bounds the whole request.
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                ProviderError::InvalidRequest(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }

    /// Build a header map from static config plus per-call auth headers.
    ///
    /// A config header that does not parse is a request error; an auth value
    /// that does not parse is a credential error, since it comes from the key.
    pub fn headers(
        extra: &HashMap<String, String>,
        auth: &[(&str, &str)],
    ) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (key, value) in extra {
            let value = HeaderValue::from_str(value).map_err(|e| {
                ProviderError::InvalidRequest(format!("Invalid value for header '{}': {}", key, e))
            })?;
            headers.insert(header_name(key)?, value);
        }

        for (key, value) in auth {
            let mut value = HeaderValue::from_str(value).map_err(|e| {
                ProviderError::InvalidCredential(format!(
                    "Key is not a valid '{}' header value: {}",
                    key, e
                ))
            })?;
            value.set_sensitive(true);
            headers.insert(header_name(key)?, value);
        }

        Ok(headers)
    }

    /// POST `body` as JSON and return the raw response text on 2xx
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        headers: HeaderMap,
        body: &T,
    ) -> Result<String, ProviderError> {
        let body_json = serde_json::to_string(body)
            .map_err(|e| ProviderError::InvalidRequest(format!("Failed to encode body: {}", e)))?;

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body_json)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return Ok(text);
        }

        Err(ProviderError::Http {
            status: status.as_u16(),
            body: truncate(&text, MAX_ERROR_BODY),
        })
    }
}

fn header_name(key: &str) -> Result<HeaderName, ProviderError> {
    HeaderName::try_from(key)
        .map_err(|e| ProviderError::InvalidRequest(format!("Invalid header name '{}': {}", key, e)))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
