pub mod anthropic;
pub mod factory;
pub mod google;
pub mod groq;
pub(crate) mod http;
pub mod llm;
pub mod ollama;
pub mod openai;
pub mod unified;

pub use anthropic::AnthropicAdapter;
pub use factory::{known_models, supported_vendors, ProviderFactory, VendorInfo};
pub use google::GoogleAdapter;
pub use groq::GroqAdapter;
pub use llm::{CompletionResult, LLMAdapter, Message, ModelConfig, ProviderProfile, Role, Usage, Vendor};
pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;
pub use unified::UnifiedAdapter;

#[cfg(test)]
pub(crate) mod testing {
    use super::llm::{CompletionResult, LLMAdapter, Message, Vendor};
    use crate::error::UpstreamError;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream, StreamExt};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies in order and records every request it sees.
    pub(crate) struct ScriptedAdapter {
        replies: Mutex<VecDeque<Result<String, UpstreamError>>>,
        pub(crate) requests: Mutex<Vec<Vec<Message>>>,
        context_tokens: usize,
        probe: (bool, String),
    }

    impl ScriptedAdapter {
        pub(crate) fn new(replies: Vec<Result<String, UpstreamError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                context_tokens: 100_000,
                probe: (true, "Connection successful".to_string()),
            }
        }

        pub(crate) fn replying(replies: &[&str]) -> Self {
            Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
        }

        pub(crate) fn with_context_tokens(mut self, tokens: usize) -> Self {
            self.context_tokens = tokens;
            self
        }

        pub(crate) fn failing_probe(mut self, diagnostic: &str) -> Self {
            self.probe = (false, diagnostic.to_string());
            self
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LLMAdapter for ScriptedAdapter {
        fn vendor(&self) -> Vendor {
            Vendor::Custom
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        fn context_tokens(&self) -> usize {
            self.context_tokens
        }

        async fn generate(&self, messages: &[Message]) -> Result<CompletionResult, UpstreamError> {
            self.requests.lock().unwrap().push(messages.to_vec());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("[]".to_string()))?;
            Ok(CompletionResult {
                content: reply,
                usage: None,
                model: "scripted".to_string(),
                finish_reason: Some("stop".to_string()),
            })
        }

        fn stream_generate(&self, _messages: &[Message]) -> BoxStream<'static, String> {
            stream::empty().boxed()
        }

        async fn test_connection(&self) -> (bool, String) {
            self.probe.clone()
        }

        async fn list_models(&self) -> Vec<String> {
            vec!["scripted".to_string()]
        }
    }
}
