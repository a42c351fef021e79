//! Gemini `generateContent` client

use crate::api::{GenerateContentRequest, GenerateContentResponse};
use crate::client::http::truncate;
use crate::client::{HttpClient, ProviderClient, ProviderError};
use crate::config::{Provider, ProviderConfig};
use async_trait::async_trait;
use std::collections::HashMap;

pub struct GeminiClient {
    base_url: String,
    headers: HashMap<String, String>,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(config: &ProviderConfig, http: HttpClient) -> Self {
        Self {
            base_url: config.get_base_url(),
            headers: config.headers.clone(),
            http,
        }
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn complete(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        // header auth keeps the key out of request URLs
        let headers = HttpClient::headers(&self.headers, &[("x-goog-api-key", api_key)])?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            model
        );

        let body = self
            .http
            .post_json(&url, headers, &GenerateContentRequest::from_prompt(prompt))
            .await?;

        let response: GenerateContentResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::Malformed(format!(
                "Failed to parse response: {}. Body: {}",
                e,
                truncate(&body, 500)
            ))
        })?;

        match response.text() {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(ProviderError::Malformed("response carried no text".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::registry;
    use std::time::Duration;

    fn client(base_url: String) -> GeminiClient {
        let mut config = registry().get(Provider::Gemini).unwrap().clone();
        config.base_url = base_url;
        config.api_base_env = None;
        GeminiClient::new(&config, HttpClient::new(Duration::from_secs(5)).unwrap())
    }

    #[tokio::test]
    async fn test_complete_targets_model_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/models/gemini-1.5-flash:generateContent")
            .match_header("x-goog-api-key", "AIza-test")
            .with_status(200)
            .with_body(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi Jo"}]}}]}"#)
            .create_async()
            .await;

        let text = client(server.url())
            .complete("AIza-test", "gemini-1.5-flash", "intro")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(text, "Hi Jo");
    }

    #[tokio::test]
    async fn test_invalid_key_body_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/models/gemini-1.5-flash:generateContent")
            .with_status(400)
            .with_body(r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT"}}"#)
            .create_async()
            .await;

        let err = client(server.url())
            .complete("bad", "gemini-1.5-flash", "intro")
            .await
            .unwrap_err();
        match err {
            ProviderError::Http { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("API key not valid"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
