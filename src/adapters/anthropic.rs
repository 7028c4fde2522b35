use crate::adapters::factory::known_models;
use crate::adapters::http::{self, Frame};
use crate::adapters::llm::{CompletionResult, LLMAdapter, Message, ModelConfig, Role, Usage, Vendor};
use crate::error::{Error, UpstreamError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const VENDOR: &str = "anthropic";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    config: ModelConfig,
    api_key: String,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<Content>,
    model: Option<String>,
    usage: Option<AnthropicUsage>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
}

impl AnthropicAdapter {
    pub fn new(config: ModelConfig) -> Result<Self, Error> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::config("Anthropic API key not found"))?;
        let client = http::build_client()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn request_body<'a>(&'a self, messages: &'a [Message], stream: bool) -> AnthropicRequest<'a> {
        // The system turn moves to a top-level field; only user/assistant stay in the array.
        let mut system: Option<String> = None;
        let mut wire = Vec::with_capacity(messages.len());
        for message in messages {
            match message.role {
                Role::System => match system.as_mut() {
                    Some(existing) => {
                        existing.push_str("\n\n");
                        existing.push_str(&message.content);
                    }
                    None => system = Some(message.content.clone()),
                },
                Role::User | Role::Assistant => wire.push(WireMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                }),
            }
        }

        AnthropicRequest {
            model: &self.config.model_name,
            messages: wire,
            max_tokens: 4096.min(self.config.context_tokens / 4).max(1),
            temperature: 0.1,
            system,
            stream,
        }
    }

    fn post(&self, body: &AnthropicRequest<'_>, timeout: Duration) -> RequestBuilder {
        self.client
            .post(format!("{}/messages", self.config.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(body)
    }
}

/// Only `content_block_delta` events with a `text_delta` carry text.
fn decode_event(line: &str) -> Frame {
    let Some(data) = http::sse_data(line) else {
        return Frame::Skip;
    };
    let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
        return Frame::Skip;
    };
    match event.event_type.as_str() {
        "content_block_delta" => match event.delta {
            Some(StreamDelta {
                delta_type: Some(kind),
                text: Some(text),
            }) if kind == "text_delta" => Frame::Text(text),
            _ => Frame::Skip,
        },
        "message_stop" => Frame::Done,
        _ => Frame::Skip,
    }
}

#[async_trait]
impl LLMAdapter for AnthropicAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Anthropic
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn context_tokens(&self) -> usize {
        self.config.context_tokens
    }

    async fn generate(&self, messages: &[Message]) -> Result<CompletionResult, UpstreamError> {
        let body = self.request_body(messages, false);
        let response = http::send(VENDOR, self.post(&body, self.config.timeouts.request())).await?;
        let parsed: AnthropicResponse = http::read_json(VENDOR, response).await?;

        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .map(|block| block.text.as_str())
            .collect();
        if content.is_empty() {
            tracing::warn!("Anthropic returned empty content");
        }

        Ok(CompletionResult {
            content,
            usage: parsed
                .usage
                .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
            model: parsed
                .model
                .unwrap_or_else(|| self.config.model_name.clone()),
            finish_reason: parsed.stop_reason,
        })
    }

    fn stream_generate(&self, messages: &[Message]) -> BoxStream<'static, String> {
        let body = self.request_body(messages, true);
        http::frame_stream(VENDOR, self.post(&body, self.config.timeouts.stream()), decode_event)
    }

    async fn list_models(&self) -> Vec<String> {
        // No listing endpoint is used for this vendor.
        known_models(Vendor::Anthropic)
    }
}
