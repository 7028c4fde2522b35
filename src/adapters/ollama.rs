use crate::adapters::factory::known_models;
use crate::adapters::http::{self, Frame};
use crate::adapters::llm::{CompletionResult, LLMAdapter, Message, ModelConfig, Usage, Vendor};
use crate::error::{Error, UpstreamError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

const VENDOR: &str = "ollama";

pub struct OllamaAdapter {
    client: Client,
    config: ModelConfig,
}

#[derive(Serialize)]
struct Options {
    temperature: f32,
    num_predict: usize,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OllamaRequest<'a> {
    Generate {
        model: &'a str,
        prompt: &'a str,
        stream: bool,
        options: Options,
    },
    Chat {
        model: &'a str,
        messages: Vec<WireMessage<'a>>,
        stream: bool,
        options: Options,
    },
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Shared shape of `/api/generate` and `/api/chat` responses and stream lines.
#[derive(Deserialize)]
struct OllamaResponse {
    model: Option<String>,
    response: Option<String>,
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<usize>,
    eval_count: Option<usize>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

impl OllamaResponse {
    fn text(&self) -> String {
        match (&self.response, &self.message) {
            (Some(text), _) => text.clone(),
            (None, Some(message)) => message.content.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<Tag>,
}

#[derive(Deserialize)]
struct Tag {
    name: String,
}

impl OllamaAdapter {
    pub fn new(config: ModelConfig) -> Result<Self, Error> {
        let client = http::build_client()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn model(&self) -> &str {
        self.config
            .model_name
            .strip_prefix("ollama:")
            .unwrap_or(&self.config.model_name)
    }

    /// A lone message goes to the completion endpoint, conversations to chat.
    fn request<'a>(&'a self, messages: &'a [Message], stream: bool) -> (&'static str, OllamaRequest<'a>) {
        let options = Options {
            temperature: 0.1,
            num_predict: 4096.min(self.config.context_tokens / 4).max(1),
        };
        match messages {
            [single] => (
                "/api/generate",
                OllamaRequest::Generate {
                    model: self.model(),
                    prompt: &single.content,
                    stream,
                    options,
                },
            ),
            _ => (
                "/api/chat",
                OllamaRequest::Chat {
                    model: self.model(),
                    messages: messages
                        .iter()
                        .map(|m| WireMessage {
                            role: m.role.as_str(),
                            content: &m.content,
                        })
                        .collect(),
                    stream,
                    options,
                },
            ),
        }
    }

    fn post(&self, path: &str, body: &OllamaRequest<'_>) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.config.base_url, path))
            .header("Content-Type", "application/json")
            .timeout(self.config.timeouts.local())
            .json(body)
    }

    async fn tags(&self) -> Result<Vec<String>, UpstreamError> {
        let request = self
            .client
            .get(format!("{}/api/tags", self.config.base_url))
            .timeout(self.config.timeouts.probe());
        let response = http::send(VENDOR, request).await?;
        let tags: TagList = http::read_json(VENDOR, response).await?;
        Ok(tags.models.into_iter().map(|t| t.name).collect())
    }
}

/// Newline-delimited JSON; a line with `done: true` ends the stream.
fn decode_line(line: &str) -> Frame {
    match serde_json::from_str::<OllamaResponse>(line) {
        Ok(chunk) if chunk.done => Frame::Last(chunk.text()),
        Ok(chunk) => Frame::Text(chunk.text()),
        Err(_) => Frame::Skip,
    }
}

#[async_trait]
impl LLMAdapter for OllamaAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Ollama
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn context_tokens(&self) -> usize {
        self.config.context_tokens
    }

    async fn generate(&self, messages: &[Message]) -> Result<CompletionResult, UpstreamError> {
        let (path, body) = self.request(messages, false);
        let response = http::send(VENDOR, self.post(path, &body)).await?;
        let parsed: OllamaResponse = http::read_json(VENDOR, response).await?;

        let content = parsed.text();
        if content.is_empty() {
            tracing::warn!("Ollama returned empty content");
        }

        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (Some(prompt), Some(completion)) => Some(Usage::new(prompt, completion)),
            _ => None,
        };

        Ok(CompletionResult {
            content,
            usage,
            model: parsed.model.unwrap_or_else(|| self.model().to_string()),
            finish_reason: Some(if parsed.done { "stop" } else { "length" }.to_string()),
        })
    }

    fn stream_generate(&self, messages: &[Message]) -> BoxStream<'static, String> {
        let (path, body) = self.request(messages, true);
        http::frame_stream(VENDOR, self.post(path, &body), decode_line)
    }

    async fn test_connection(&self) -> (bool, String) {
        let response = self
            .client
            .get(format!("{}/api/tags", self.config.base_url))
            .timeout(self.config.timeouts.probe())
            .send()
            .await;
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(_) => return (false, "Ollama service not running".to_string()),
            Err(err) if err.is_connect() => {
                return (
                    false,
                    "Cannot connect to Ollama. Make sure it's running on the specified endpoint."
                        .to_string(),
                );
            }
            Err(err) => return (false, format!("Connection failed: {}", err)),
        };
        let available: Vec<String> = match http::read_json::<TagList>(VENDOR, response).await {
            Ok(tags) => tags.models.into_iter().map(|t| t.name).collect(),
            Err(err) => return (false, format!("Connection failed: {}", err)),
        };

        if !available.iter().any(|m| m == self.model()) {
            return (
                false,
                format!(
                    "Model {} not found. Available models: {}",
                    self.model(),
                    available.join(", ")
                ),
            );
        }

        let probe = [Message::user(
            "Hello, please respond with 'OK' if you can hear me.",
        )];
        match self.generate(&probe).await {
            Ok(response) if !response.content.trim().is_empty() => {
                (true, "Connection successful".to_string())
            }
            Ok(_) => (false, "Empty response from API".to_string()),
            Err(err) => (false, format!("Connection failed: {}", err)),
        }
    }

    async fn list_models(&self) -> Vec<String> {
        self.tags().await.unwrap_or_else(|err| {
            tracing::warn!("Falling back to known Ollama models: {}", err);
            known_models(Vendor::Ollama)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::error::ErrorCategory;
    use futures::StreamExt;
    use mockito::Matcher;

    fn adapter(base_url: String) -> OllamaAdapter {
        OllamaAdapter::new(ModelConfig {
            model_name: "llama3".to_string(),
            api_key: None,
            base_url,
            context_tokens: 8000,
            timeouts: Timeouts::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn single_message_uses_generate_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "llama3",
                "prompt": "hi",
                "stream": false,
                "options": {"num_predict": 2000}
            })))
            .with_status(200)
            .with_body(r#"{"model":"llama3","response":"hello","done":true,"prompt_eval_count":3,"eval_count":2}"#)
            .create_async()
            .await;

        let result = adapter(server.url())
            .generate(&[Message::user("hi")])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.content, "hello");
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.usage, Some(Usage::new(3, 2)));
    }

    #[tokio::test]
    async fn conversation_uses_chat_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(r#"{"model":"llama3","message":{"role":"assistant","content":"[]"},"done":false}"#)
            .create_async()
            .await;

        let result = adapter(server.url())
            .generate(&[Message::system("sys"), Message::user("hi")])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.content, "[]");
        assert_eq!(result.finish_reason.as_deref(), Some("length"));
        assert!(result.usage.is_none());
    }

    #[tokio::test]
    async fn stream_stops_at_done_flag() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "{\"message\":{\"content\":\"a\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"b\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
            "{\"message\":{\"content\":\"late\"},\"done\":false}\n",
        );
        let _mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let fragments: Vec<String> = adapter(server.url())
            .stream_generate(&[Message::system("s"), Message::user("u")])
            .collect()
            .await;
        assert_eq!(fragments, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_category() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate")
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
    async fn probe_reports_missing_model() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"mistral:latest"},{"name":"phi3"}]}"#)
            .create_async()
            .await;

        let (ok, diagnostic) = adapter(server.url()).test_connection().await;
        assert!(!ok);
        assert_eq!(
            diagnostic,
            "Model llama3 not found. Available models: mistral:latest, phi3"
        );
    }

    #[tokio::test]
    async fn probe_succeeds_when_model_answers() {
        let mut server = mockito::Server::new_async().await;
        let _tags = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"llama3"}]}"#)
            .create_async()
            .await;
        let _generate = server
            .mock("POST", "/api/generate")
            .with_status(200)
            .with_body(r#"{"response":"OK","done":true}"#)
            .create_async()
            .await;

        let (ok, diagnostic) = adapter(server.url()).test_connection().await;
        assert!(ok, "{}", diagnostic);
    }

    #[tokio::test]
    async fn list_models_falls_back_when_service_is_down() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/tags")
            .with_status(503)
            .create_async()
            .await;

        let models = adapter(server.url()).list_models().await;
        assert_eq!(models, known_models(Vendor::Ollama));
        assert!(!models.is_empty());
    }
}
