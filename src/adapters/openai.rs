use crate::adapters::factory::known_models;
use crate::adapters::http::{self, Frame};
use crate::adapters::llm::{CompletionResult, LLMAdapter, Message, ModelConfig, Usage, Vendor};
use crate::error::{Error, ErrorCategory, UpstreamError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const VENDOR: &str = "openai";

pub struct OpenAIAdapter {
    client: Client,
    config: ModelConfig,
    api_key: String,
}

#[derive(Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

#[derive(Serialize)]
pub(crate) struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

pub(crate) fn wire_messages(messages: &[Message]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect()
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Reasoning-tier models (o1, o3, o4 families, or any id mentioning o4) take
/// `max_completion_tokens` and only accept the default temperature.
pub fn is_reasoning_model(model: &str) -> bool {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    let mut chars = name.chars();
    let tier_prefix = matches!(
        (chars.next(), chars.next()),
        (Some('o'), Some(d)) if d.is_ascii_digit()
    );
    tier_prefix || name.contains("o4")
}

fn with_auth(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request.header("Authorization", format!("Bearer {}", key)),
        None => request,
    }
}

/// One non-streaming call against an OpenAI-compatible chat endpoint.
pub(crate) async fn chat(
    vendor: &'static str,
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    body: &ChatRequest<'_>,
    timeout: Duration,
) -> Result<CompletionResult, UpstreamError> {
    let request = with_auth(client.post(format!("{}/chat/completions", base_url)), api_key)
        .header("Content-Type", "application/json")
        .timeout(timeout)
        .json(body);

    let response = http::send(vendor, request).await?;
    let parsed: ChatResponse = http::read_json(vendor, response).await?;

    let choice = parsed.choices.into_iter().next().ok_or_else(|| {
        UpstreamError::new(vendor, ErrorCategory::Unknown, "response contained no choices")
    })?;
    let content = choice.message.content.unwrap_or_default();
    if content.is_empty() {
        tracing::warn!("{} returned empty content", vendor);
    }

    Ok(CompletionResult {
        content,
        usage: parsed
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
        model: parsed.model.unwrap_or_else(|| body.model.to_string()),
        finish_reason: choice.finish_reason,
    })
}

pub(crate) fn chat_stream(
    vendor: &'static str,
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    body: &ChatRequest<'_>,
    timeout: Duration,
) -> BoxStream<'static, String> {
    let request = with_auth(client.post(format!("{}/chat/completions", base_url)), api_key)
        .header("Content-Type", "application/json")
        .timeout(timeout)
        .json(body);
    http::frame_stream(vendor, request, decode_sse_delta)
}

/// SSE `data: {...}` lines carrying `choices[0].delta.content`, ending at `[DONE]`.
pub(crate) fn decode_sse_delta(line: &str) -> Frame {
    let Some(data) = http::sse_data(line) else {
        return Frame::Skip;
    };
    if data == "[DONE]" {
        return Frame::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .map(Frame::Text)
            .unwrap_or(Frame::Skip),
        Err(_) => Frame::Skip,
    }
}

pub(crate) async fn fetch_model_ids(
    vendor: &'static str,
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<Vec<String>, UpstreamError> {
    let request = with_auth(client.get(format!("{}/models", base_url)), api_key).timeout(timeout);
    let response = http::send(vendor, request).await?;
    let list: ModelList = http::read_json(vendor, response).await?;
    Ok(list.data.into_iter().map(|m| m.id).collect())
}

impl OpenAIAdapter {
    pub fn new(config: ModelConfig) -> Result<Self, Error> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::config("OpenAI API key not found"))?;
        let client = http::build_client()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn request_body<'a>(&'a self, messages: &'a [Message], stream: bool) -> ChatRequest<'a> {
        let ctx = self.config.context_tokens;
        let mut body = ChatRequest {
            model: &self.config.model_name,
            messages: wire_messages(messages),
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            stream,
        };
        if is_reasoning_model(&self.config.model_name) {
            // Reasoning overhead needs far more headroom than the usual ctx/4.
            body.max_completion_tokens = Some(4000.min(ctx.saturating_sub(500)).max(1));
            body.temperature = Some(1.0);
        } else {
            body.max_tokens = Some(1000.min(ctx / 4).max(1));
            body.temperature = Some(0.1);
        }
        body
    }
}

#[async_trait]
impl LLMAdapter for OpenAIAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::OpenAI
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn context_tokens(&self) -> usize {
        self.config.context_tokens
    }

    async fn generate(&self, messages: &[Message]) -> Result<CompletionResult, UpstreamError> {
        let body = self.request_body(messages, false);
        chat(
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
        chat_stream(
            VENDOR,
            &self.client,
            &self.config.base_url,
            Some(&self.api_key),
            &body,
            self.config.timeouts.stream(),
        )
    }

    async fn test_connection(&self) -> (bool, String) {
        tracing::info!(
            "Testing OpenAI connection to {} with model {}",
            self.config.base_url,
            self.config.model_name
        );
        let probe = [Message::user("test")];
        let mut body = self.request_body(&probe, false);
        if body.max_completion_tokens.is_some() {
            body.max_completion_tokens = Some(1);
        } else {
            body.max_tokens = Some(1);
        }

        let request = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.config.timeouts.probe())
            .json(&body);

        match request.send().await {
            Ok(response) => match response.status().as_u16() {
                200 => (true, "Connection successful".to_string()),
                401 => (false, "Invalid API key".to_string()),
                429 => (false, "Rate limit exceeded".to_string()),
                status => {
                    let text = response.text().await.unwrap_or_default();
                    let detail = if text.is_empty() {
                        "No error details".to_string()
                    } else {
                        http::preview(&text, 200)
                    };
                    (false, format!("API error {}: {}", status, detail))
                }
            },
            Err(err) if err.is_timeout() => (false, format!("Connection timeout: {}", err)),
            Err(err) if err.is_connect() => (false, format!("Connection error: {}", err)),
            Err(err) => (false, format!("Connection failed: {}", err)),
        }
    }

    async fn list_models(&self) -> Vec<String> {
        match fetch_model_ids(
            VENDOR,
            &self.client,
            &self.config.base_url,
            Some(&self.api_key),
            self.config.timeouts.probe(),
        )
        .await
        {
            Ok(ids) => {
                let mut models: Vec<String> = ids
                    .into_iter()
                    .filter(|id| ["gpt", "o1", "o3", "o4"].iter().any(|p| id.contains(p)))
                    .collect();
                models.sort_by(|a, b| b.cmp(a));
                models
            }
            Err(err) => {
                tracing::warn!("Falling back to known OpenAI models: {}", err);
                known_models(Vendor::OpenAI)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use futures::StreamExt;
    use mockito::Matcher;

    fn adapter(base_url: String, model: &str) -> OpenAIAdapter {
        OpenAIAdapter::new(ModelConfig {
            model_name: model.to_string(),
            api_key: Some("sk-test".to_string()),
            base_url,
            context_tokens: 8000,
            timeouts: Timeouts::default(),
        })
        .unwrap()
    }

    #[test]
    fn reasoning_models_are_detected() {
        assert!(is_reasoning_model("o1-mini"));
        assert!(is_reasoning_model("o4-mini-high"));
        assert!(is_reasoning_model("openai/o3"));
        assert!(is_reasoning_model("gpt-o4-mini"));
        assert!(!is_reasoning_model("gpt-4o"));
        assert!(!is_reasoning_model("ollama"));
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let result = OpenAIAdapter::new(ModelConfig {
            model_name: "gpt-4o".to_string(),
            api_key: None,
            base_url: "http://localhost".to_string(),
            context_tokens: 8000,
            timeouts: Timeouts::default(),
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn reasoning_body_uses_completion_token_field() {
        let adapter = adapter("http://localhost".to_string(), "o4-mini");
        let messages = [Message::user("hi")];
        let body = serde_json::to_value(adapter.request_body(&messages, false)).unwrap();
        assert_eq!(body["max_completion_tokens"], 4000);
        assert_eq!(body["temperature"], 1.0);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn embedded_o4_id_gets_reasoning_body() {
        let adapter = adapter("http://localhost".to_string(), "gpt-o4-mini");
        let body = serde_json::to_value(adapter.request_body(&[Message::user("hi")], false)).unwrap();
        assert_eq!(body["max_completion_tokens"], 4000);
        assert_eq!(body["temperature"], 1.0);
        assert!(body.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn generate_parses_chat_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "gpt-4o",
                "max_tokens": 1000,
                "messages": [{"role": "system", "content": "sys"}, {"role": "user", "content": "hi"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"model":"gpt-4o-2024","choices":[{"message":{"role":"assistant","content":"[]"},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#,
            )
            .create_async()
            .await;

        let adapter = adapter(server.url(), "gpt-4o");
        let result = adapter
            .generate(&[Message::system("sys"), Message::user("hi")])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.content, "[]");
        assert_eq!(result.model, "gpt-4o-2024");
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.usage, Some(Usage::new(12, 3)));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_category() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"Incorrect API key"}}"#)
            .create_async()
            .await;

        let err = adapter(server.url(), "gpt-4o")
            .generate(&[Message::user("hi")])
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Auth);
    }

    #[tokio::test]
    async fn rate_limit_maps_to_rate_limit_category() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .create_async()
            .await;

        let err = adapter(server.url(), "gpt-4o")
            .generate(&[Message::user("hi")])
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::RateLimit);
    }

    #[tokio::test]
    async fn stream_stops_at_done_sentinel() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let _mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(serde_json::json!({"stream": true})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let fragments: Vec<String> = adapter(server.url(), "gpt-4o")
            .stream_generate(&[Message::user("hi")])
            .collect()
            .await;
        assert_eq!(fragments, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn probe_reports_invalid_key_without_failing() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .create_async()
            .await;

        let (ok, diagnostic) = adapter(server.url(), "gpt-4o").test_connection().await;
        assert!(!ok);
        assert_eq!(diagnostic, "Invalid API key");
    }

    #[tokio::test]
    async fn connection_test_reports_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(serde_json::json!({"max_tokens": 1})))
            .with_status(429)
            .with_body(r#"{"error":{"message":"Rate limit reached"}}"#)
            .create_async()
            .await;

        let (ok, diagnostic) = adapter(server.url(), "gpt-4o").test_connection().await;
        mock.assert_async().await;
        assert!(!ok);
        assert_eq!(diagnostic, "Rate limit exceeded");
    }

    #[tokio::test]
    async fn list_models_filters_and_sorts_descending() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/models")
            .with_status(200)
            .with_body(r#"{"data":[{"id":"gpt-4o"},{"id":"whisper-1"},{"id":"o3"},{"id":"gpt-3.5-turbo"}]}"#)
            .create_async()
            .await;

        let models = adapter(server.url(), "gpt-4o").list_models().await;
        assert_eq!(models, vec!["o3", "gpt-4o", "gpt-3.5-turbo"]);
    }

    #[tokio::test]
    async fn list_models_falls_back_on_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/models")
            .with_status(500)
            .create_async()
            .await;

        let models = adapter(server.url(), "gpt-4o").list_models().await;
        assert_eq!(models, known_models(Vendor::OpenAI));
        assert!(!models.is_empty());
    }
}
