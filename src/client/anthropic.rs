//! Anthropic Messages client

use crate::api::{MessagesRequest, MessagesResponse};
use crate::client::http::truncate;
use crate::client::{HttpClient, ProviderClient, ProviderError};
use crate::config::{Provider, ProviderConfig};
use async_trait::async_trait;
use std::collections::HashMap;

const MAX_TOKENS: u32 = 1024;

pub struct AnthropicClient {
    base_url: String,
    headers: HashMap<String, String>,
    http: HttpClient,
}

impl AnthropicClient {
    pub fn new(config: &ProviderConfig, http: HttpClient) -> Self {
        Self {
            base_url: config.get_base_url(),
            headers: config.headers.clone(),
            http,
        }
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn complete(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let headers = HttpClient::headers(&self.headers, &[("x-api-key", api_key)])?;
        let request = MessagesRequest::from_prompt(model, prompt, MAX_TOKENS);
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));

        let body = self.http.post_json(&url, headers, &request).await?;

        let response: MessagesResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::Malformed(format!(
                "Failed to parse response: {}. Body: {}",
                e,
                truncate(&body, 500)
            ))
        })?;

        let text = response.text();
        if text.trim().is_empty() {
            return Err(ProviderError::Malformed("response carried no text".to_string()));
        }
        Ok(text)
    }
}
