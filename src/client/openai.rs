//! OpenAI-compatible chat completions (OpenAI, Groq)

use crate::api::{CompletionRequest, CompletionResponse};
use crate::client::http::truncate;
use crate::client::{HttpClient, ProviderClient, ProviderError};
use crate::config::{Provider, ProviderConfig};
use async_trait::async_trait;
use std::collections::HashMap;

pub struct OpenAiCompatibleClient {
    provider: Provider,
    base_url: String,
    headers: HashMap<String, String>,
    http: HttpClient,
}

impl OpenAiCompatibleClient {
    pub fn new(provider: Provider, config: &ProviderConfig, http: HttpClient) -> Self {
        Self {
            provider,
            base_url: config.get_base_url(),
            headers: config.headers.clone(),
            http,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn complete(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let bearer = format!("Bearer {}", api_key);
        let headers = HttpClient::headers(&self.headers, &[("authorization", bearer.as_str())])?;
        let request = CompletionRequest::from_prompt(model, prompt).with_temperature(0.7);

        let body = self.http.post_json(&self.url(), headers, &request).await?;

        let response: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::Malformed(format!(
                "Failed to parse response: {}. Body: {}",
                e,
                truncate(&body, 500)
            ))
        })?;

        match response.content() {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(ProviderError::Malformed("response carried no text".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::registry;
    use mockito::Matcher;
    use std::time::Duration;

    fn client(base_url: &str) -> OpenAiCompatibleClient {
        let mut config = registry().get(Provider::Groq).unwrap().clone();
        config.base_url = base_url.to_string();
        config.api_base_env = None;
        OpenAiCompatibleClient::new(
            Provider::Groq,
            &config,
            HttpClient::new(Duration::from_secs(5)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer gsk_test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "llama-3.1-8b-instant",
                "messages": [{ "role": "user", "content": "Write an intro" }]
            })))
            .with_status(200)
            .with_body(
                r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"Hi Sam,"}}]}"#,
            )
            .create_async()
            .await;

        let text = client(&server.url())
            .complete("gsk_test", "llama-3.1-8b-instant", "Write an intro")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(text, "Hi Sam,");
    }

    #[tokio::test]
    async fn test_empty_content_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"  "}}]}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .complete("k", "m", "p")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_status_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(r#"{"error":{"message":"Rate limit reached"}}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .complete("k", "m", "p")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 429, .. }));
    }
}
