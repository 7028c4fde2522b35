use crate::adapters::factory::known_models;
use crate::adapters::http;
use crate::adapters::llm::{CompletionResult, LLMAdapter, Message, ModelConfig, Vendor};
use crate::adapters::openai::{self, ChatRequest};
use crate::error::{Error, UpstreamError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;

const VENDOR: &str = "unified";

/// Catch-all adapter for any OpenAI-compatible server: self-hosted gateways,
/// model proxies, or a `custom` profile. When routed through a proxy, `vendor`
/// keeps the profile's family so model fallbacks stay meaningful.
pub struct UnifiedAdapter {
    client: Client,
    config: ModelConfig,
    vendor: Vendor,
}

/// Model id in the `provider/model` convention used by multi-vendor proxies.
pub fn proxy_model_name(vendor: Vendor, model: &str) -> String {
    match vendor {
        Vendor::OpenAI | Vendor::Custom => model.to_string(),
        Vendor::Anthropic => format!("anthropic/{}", model),
        Vendor::Google if model.to_lowercase().contains("gemini") => format!("gemini/{}", model),
        Vendor::Google => format!("vertex_ai/{}", model),
        Vendor::Groq => format!("groq/{}", model),
        Vendor::Ollama => format!("ollama/{}", model),
    }
}

impl UnifiedAdapter {
    pub fn new(vendor: Vendor, config: ModelConfig) -> Result<Self, Error> {
        if config.base_url.trim().is_empty() {
            return Err(Error::config("unified adapter needs an endpoint"));
        }
        let client = http::build_client()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            vendor,
        })
    }

    fn api_key(&self) -> Option<&str> {
        self.config.api_key.as_deref().filter(|k| !k.is_empty())
    }

    fn request_body<'a>(&'a self, messages: &'a [Message], stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.config.model_name,
            messages: openai::wire_messages(messages),
            max_tokens: Some(4000.min(self.config.context_tokens / 4).max(1)),
            max_completion_tokens: None,
            temperature: Some(0.1),
            top_p: None,
            stream,
        }
    }
}

#[async_trait]
impl LLMAdapter for UnifiedAdapter {
    fn vendor(&self) -> Vendor {
        self.vendor
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
            self.api_key(),
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
            self.api_key(),
            &body,
            self.config.timeouts.stream(),
        )
    }

    async fn list_models(&self) -> Vec<String> {
        openai::fetch_model_ids(
            VENDOR,
            &self.client,
            &self.config.base_url,
            self.api_key(),
            self.config.timeouts.probe(),
        )
        .await
        .unwrap_or_else(|err| {
            tracing::warn!("Falling back to known {} models: {}", self.vendor, err);
            known_models(self.vendor)
        })
    }
}
