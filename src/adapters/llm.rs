use crate::config::Timeouts;
use crate::error::UpstreamError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversation turn in vendor-neutral form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// The closed set of vendor families an adapter exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    OpenAI,
    Anthropic,
    Google,
    Groq,
    Ollama,
    Custom,
}

impl Vendor {
    pub const ALL: [Vendor; 6] = [
        Vendor::OpenAI,
        Vendor::Anthropic,
        Vendor::Google,
        Vendor::Groq,
        Vendor::Ollama,
        Vendor::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::OpenAI => "openai",
            Vendor::Anthropic => "anthropic",
            Vendor::Google => "google",
            Vendor::Groq => "groq",
            Vendor::Ollama => "ollama",
            Vendor::Custom => "custom",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Vendor::ALL
            .into_iter()
            .find(|v| v.as_str() == lower)
            .ok_or_else(|| format!("unsupported LLM vendor '{}'", s))
    }
}

/// A persisted binding of vendor, model, endpoint and credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub vendor: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Stored credential; ciphertext once it has passed through the store.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub context_tokens: Option<usize>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Fully resolved settings an adapter is constructed from.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_name: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub context_tokens: usize,
    pub timeouts: Timeouts,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Shared contract every vendor adapter implements.
#[async_trait]
pub trait LLMAdapter: Send + Sync {
    fn vendor(&self) -> Vendor;

    fn model_name(&self) -> &str;

    fn context_tokens(&self) -> usize;

    async fn generate(&self, messages: &[Message]) -> Result<CompletionResult, UpstreamError>;

    /// Text fragments as they arrive. Failures end the stream with one
    /// `Error: ...` fragment.
    fn stream_generate(&self, messages: &[Message]) -> BoxStream<'static, String>;

    async fn test_connection(&self) -> (bool, String) {
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

    /// Never fails; upstream errors fall back to the registry's known models.
    async fn list_models(&self) -> Vec<String>;

    fn estimate_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    /// Whether `text` fits the whole context window, with no room kept for a reply.
    fn can_handle_context(&self, text: &str) -> bool {
        self.estimate_tokens(text) <= self.context_tokens()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_parses_case_insensitively() {
        assert_eq!("OpenAI".parse::<Vendor>().unwrap(), Vendor::OpenAI);
        assert_eq!(" ollama ".parse::<Vendor>().unwrap(), Vendor::Ollama);
        assert!("mistral-cloud".parse::<Vendor>().is_err());
    }

    #[test]
    fn token_estimate_is_quarter_of_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("äöüß"), 1);
    }

    #[test]
    fn message_serializes_lowercase_role() {
        let json = serde_json::to_string(&Message::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
