use crate::adapters::factory::known_models;
use crate::adapters::http;
use crate::adapters::llm::{CompletionResult, LLMAdapter, Message, ModelConfig, Vendor};
use crate::adapters::openai::{self, ChatRequest};
use crate::error::{Error, UpstreamError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;

const VENDOR: &str = "groq";

/// Groq speaks the OpenAI chat protocol with its own token and sampling defaults.
pub struct GroqAdapter {
    client: Client,
    config: ModelConfig,
    api_key: String,
}

impl GroqAdapter {
    pub fn new(config: ModelConfig) -> Result<Self, Error> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::config("Groq API key not found"))?;
        let client = http::build_client()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn request_body<'a>(&'a self, messages: &'a [Message], stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.config.model_name,
            messages: openai::wire_messages(messages),
            max_tokens: Some(4096.min(self.config.context_tokens / 4).max(1)),
            max_completion_tokens: None,
            temperature: Some(0.1),
            top_p: Some(0.95),
            stream,
        }
    }
}

#[async_trait]
impl LLMAdapter for GroqAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Groq
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn context_tokens(&self) -> usize {
        self.config.context_tokens
    }

    async fn generate(&self, messages: &[Message]) -> Result<CompletionResult, UpstreamError> {
        let body = self.request_body(messages, false);
        openai::chat(
            VENDOR,
            &self.client,
            &self.config.base_url,
            Some(&self.api_key),
            &body,
            self.config.timeouts.request(),
        )
        .await
    }

    fn stream_generate(&self, messages: &[Message]) -> BoxStream<'static, String> {
        let body = self.request_body(messages, true);
        openai::chat_stream(
            VENDOR,
            &self.client,
            &self.config.base_url,
            Some(&self.api_key),
            &body,
            self.config.timeouts.stream(),
        )
    }

    async fn list_models(&self) -> Vec<String> {
        openai::fetch_model_ids(
            VENDOR,
            &self.client,
            &self.config.base_url,
            Some(&self.api_key),
            self.config.timeouts.probe(),
        )
        .await
        .unwrap_or_else(|err| {
            tracing::warn!("Falling back to known Groq models: {}", err);
            known_models(Vendor::Groq)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::error::ErrorCategory;
    use mockito::Matcher;

    fn adapter(base_url: String) -> GroqAdapter {
        GroqAdapter::new(ModelConfig {
            model_name: "llama3-70b-8192".to_string(),
            api_key: Some("gsk-test".to_string()),
            base_url,
            context_tokens: 8192,
            timeouts: Timeouts::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn generate_uses_openai_compatible_wire() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer gsk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "llama3-70b-8192",
                "max_tokens": 2048,
                "top_p": 0.95
            })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"fast"},"finish_reason":"stop"}]}"#)
            .create_async()
            .await;

        let result = adapter(server.url())
            .generate(&[Message::user("hi")])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.content, "fast");
        assert_eq!(result.model, "llama3-70b-8192");
        assert!(result.usage.is_none());
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_category() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .create_async()
            .await;

        let err = adapter(server.url())
            .generate(&[Message::user("hi")])
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Auth);
    }

    #[tokio::test]
    async fn list_models_returns_every_id() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/models")
            .with_status(200)
            .with_body(r#"{"data":[{"id":"llama3-8b-8192"},{"id":"whisper-large-v3"}]}"#)
            .create_async()
            .await;

        let models = adapter(server.url()).list_models().await;
        assert_eq!(models, vec!["llama3-8b-8192", "whisper-large-v3"]);
    }
}
