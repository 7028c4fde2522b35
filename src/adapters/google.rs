use crate::adapters::factory::known_models;
use crate::adapters::http::{self, Frame};
use crate::adapters::llm::{CompletionResult, LLMAdapter, Message, ModelConfig, Role, Usage, Vendor};
use crate::error::{Error, UpstreamError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const VENDOR: &str = "google";

pub struct GoogleAdapter {
    client: Client,
    config: ModelConfig,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<WireContent<'a>>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
}

#[derive(Serialize)]
struct WireContent<'a> {
    role: &'static str,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: usize,
    top_p: f32,
    top_k: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: usize,
    #[serde(default)]
    candidates_token_count: usize,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl GoogleAdapter {
    pub fn new(config: ModelConfig) -> Result<Self, Error> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::config("Google API key not found"))?;
        let client = http::build_client()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn request_body<'a>(&'a self, messages: &'a [Message]) -> GenerateRequest<'a> {
        let mut system_parts = Vec::new();
        let mut contents = Vec::with_capacity(messages.len());
        for message in messages {
            match message.role {
                Role::System => system_parts.push(WirePart {
                    text: &message.content,
                }),
                Role::User => contents.push(WireContent {
                    role: "user",
                    parts: vec![WirePart {
                        text: &message.content,
                    }],
                }),
                Role::Assistant => contents.push(WireContent {
                    role: "model",
                    parts: vec![WirePart {
                        text: &message.content,
                    }],
                }),
            }
        }

        GenerateRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: 0.1,
                max_output_tokens: 8192.min(self.config.context_tokens / 4).max(1),
                top_p: 0.95,
                top_k: 40,
            },
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(SystemInstruction {
                    parts: system_parts,
                })
            },
        }
    }

    fn post(&self, method: &str, body: &GenerateRequest<'_>, timeout: Duration) -> RequestBuilder {
        // The key travels as a query parameter, not a header.
        self.client
            .post(format!(
                "{}/models/{}:{}",
                self.config.base_url, self.config.model_name, method
            ))
            .query(&[("key", self.api_key.as_str())])
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(body)
    }
}

/// Newline-delimited JSON objects; there is no sentinel, the body just closes.
/// Leading array punctuation is tolerated so a pretty-printed array also decodes.
fn decode_line(line: &str) -> Frame {
    let trimmed = line
        .trim()
        .trim_start_matches(['[', ','])
        .trim_end_matches([']', ','])
        .trim();
    if trimmed.is_empty() {
        return Frame::Skip;
    }
    match serde_json::from_str::<GenerateResponse>(trimmed) {
        Ok(chunk) => Frame::Text(chunk.text()),
        Err(_) => Frame::Skip,
    }
}

#[async_trait]
impl LLMAdapter for GoogleAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Google
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn context_tokens(&self) -> usize {
        self.config.context_tokens
    }

    async fn generate(&self, messages: &[Message]) -> Result<CompletionResult, UpstreamError> {
        let body = self.request_body(messages);
        let request = self.post("generateContent", &body, self.config.timeouts.request());
        let response = http::send(VENDOR, request).await?;
        let parsed: GenerateResponse = http::read_json(VENDOR, response).await?;

        let content = parsed.text();
        if content.is_empty() {
            tracing::warn!("Google returned empty content");
        }

        Ok(CompletionResult {
            content,
            usage: parsed
                .usage_metadata
                .as_ref()
                .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count)),
            model: self.config.model_name.clone(),
            finish_reason: parsed
                .candidates
                .first()
                .and_then(|c| c.finish_reason.clone()),
        })
    }

    fn stream_generate(&self, messages: &[Message]) -> BoxStream<'static, String> {
        let body = self.request_body(messages);
        let request = self.post("streamGenerateContent", &body, self.config.timeouts.stream());
        http::frame_stream(VENDOR, request, decode_line)
    }

    async fn list_models(&self) -> Vec<String> {
        let request = self
            .client
            .get(format!("{}/models", self.config.base_url))
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.config.timeouts.probe());

        let listed = match http::send(VENDOR, request).await {
            Ok(response) => http::read_json::<ModelList>(VENDOR, response).await,
            Err(err) => Err(err),
        };
        match listed {
            Ok(list) => list
                .models
                .into_iter()
                .map(|m| m.name.trim_start_matches("models/").to_string())
                .filter(|name| name.contains("gemini"))
                .collect(),
            Err(err) => {
                tracing::warn!("Falling back to known Gemini models: {}", err);
                known_models(Vendor::Google)
            }
        }
    }
}
