use crate::adapters::anthropic::AnthropicAdapter;
use crate::adapters::google::GoogleAdapter;
use crate::adapters::groq::GroqAdapter;
use crate::adapters::llm::{LLMAdapter, ModelConfig, ProviderProfile, Vendor};
use crate::adapters::ollama::OllamaAdapter;
use crate::adapters::openai::OpenAIAdapter;
use crate::adapters::unified::{proxy_model_name, UnifiedAdapter};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::services::secrets::SecretStore;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Context window assumed when neither profile, config nor registry knows the model.
const FALLBACK_CONTEXT_TOKENS: usize = 8000;

#[derive(Debug, Clone, Serialize)]
pub struct VendorInfo {
    pub display_name: &'static str,
    pub known_models: Vec<&'static str>,
    pub requires_credential: bool,
    pub default_endpoint: Option<&'static str>,
    pub context_limits: BTreeMap<&'static str, usize>,
}

fn info(
    display_name: &'static str,
    requires_credential: bool,
    default_endpoint: Option<&'static str>,
    models: &[(&'static str, usize)],
) -> VendorInfo {
    VendorInfo {
        display_name,
        known_models: models.iter().map(|(name, _)| *name).collect(),
        requires_credential,
        default_endpoint,
        context_limits: models.iter().copied().collect(),
    }
}

static REGISTRY: Lazy<BTreeMap<Vendor, VendorInfo>> = Lazy::new(|| {
    let mut registry = BTreeMap::new();
    registry.insert(
        Vendor::OpenAI,
        info(
            "OpenAI",
            true,
            Some("https://api.openai.com/v1"),
            &[
                ("gpt-4o", 128_000),
                ("gpt-4o-mini", 128_000),
                ("gpt-4-turbo", 128_000),
                ("gpt-4", 8_000),
                ("gpt-3.5-turbo", 16_000),
                ("o1-preview", 128_000),
                ("o1-mini", 128_000),
            ],
        ),
    );
    registry.insert(
        Vendor::Anthropic,
        info(
            "Anthropic Claude",
            true,
            Some("https://api.anthropic.com/v1"),
            &[
                ("claude-3-5-sonnet-20241022", 200_000),
                ("claude-3-5-haiku-20241022", 200_000),
                ("claude-3-opus-20240229", 200_000),
                ("claude-3-sonnet-20240229", 200_000),
                ("claude-3-haiku-20240307", 200_000),
            ],
        ),
    );
    registry.insert(
        Vendor::Google,
        info(
            "Google (Gemini)",
            true,
            Some("https://generativelanguage.googleapis.com/v1beta"),
            &[
                ("gemini-pro", 30_000),
                ("gemini-pro-vision", 16_000),
                ("gemini-1.5-pro", 1_000_000),
                ("gemini-1.5-flash", 1_000_000),
            ],
        ),
    );
    registry.insert(
        Vendor::Groq,
        info(
            "Groq",
            true,
            Some("https://api.groq.com/openai/v1"),
            &[
                ("llama3-70b-8192", 8_192),
                ("llama3-8b-8192", 8_192),
                ("mixtral-8x7b-32768", 32_768),
                ("gemma-7b-it", 8_192),
            ],
        ),
    );
    registry.insert(
        Vendor::Ollama,
        info(
            "Ollama (Local)",
            false,
            Some("http://localhost:11434"),
            &[
                ("llama3", 8_000),
                ("llama3.1", 128_000),
                ("codellama", 16_000),
                ("mistral", 8_000),
                ("phi3", 128_000),
            ],
        ),
    );
    registry.insert(
        Vendor::Custom,
        info("Custom (OpenAI-compatible)", false, None, &[]),
    );
    registry
});

/// Static vendor registry used to validate profiles and fill defaults.
pub fn supported_vendors() -> &'static BTreeMap<Vendor, VendorInfo> {
    &REGISTRY
}

pub fn known_models(vendor: Vendor) -> Vec<String> {
    REGISTRY
        .get(&vendor)
        .map(|info| info.known_models.iter().map(|m| m.to_string()).collect())
        .unwrap_or_default()
}

/// Builds adapters from stored profiles.
pub struct ProviderFactory {
    config: Arc<Config>,
    secrets: Arc<dyn SecretStore>,
}

impl ProviderFactory {
    pub fn new(config: Arc<Config>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { config, secrets }
    }

    pub fn create(&self, profile: &ProviderProfile) -> Result<Box<dyn LLMAdapter>> {
        let vendor: Vendor = profile.vendor.parse().map_err(Error::Configuration)?;
        let info = REGISTRY
            .get(&vendor)
            .ok_or_else(|| Error::config(format!("unsupported LLM vendor '{}'", profile.vendor)))?;
        let defaults = self.config.vendor_defaults(vendor);

        let api_key = non_empty(profile.api_key.as_deref())
            .or_else(|| non_empty(defaults.api_key.as_deref()))
            .map(|stored| self.resolve_credential(stored));
        if info.requires_credential && api_key.is_none() && self.config.proxy_url.is_none() {
            return Err(Error::config(format!(
                "profile '{}' ({}) has no API key",
                profile.name, vendor
            )));
        }

        let model_name = non_empty(profile.model_name.as_deref())
            .or_else(|| non_empty(defaults.model.as_deref()))
            .map(str::to_string)
            .ok_or_else(|| {
                Error::config(format!("profile '{}' has no model configured", profile.name))
            })?;

        let endpoint = non_empty(profile.endpoint.as_deref())
            .or_else(|| non_empty(defaults.endpoint.as_deref()))
            .or(info.default_endpoint)
            .map(|url| url.trim_end_matches('/').to_string());

        let context_tokens = profile
            .context_tokens
            .or(defaults.context_tokens)
            .or_else(|| info.context_limits.get(model_name.as_str()).copied())
            .unwrap_or(FALLBACK_CONTEXT_TOKENS);

        if let Some(proxy_url) = non_empty(self.config.proxy_url.as_deref()) {
            tracing::info!("Routing {} profile '{}' through proxy {}", vendor, profile.name, proxy_url);
            let config = ModelConfig {
                model_name: proxy_model_name(vendor, &model_name),
                api_key: Some(self.config.proxy_api_key.clone()),
                base_url: proxy_url.trim_end_matches('/').to_string(),
                context_tokens,
                timeouts: self.config.timeouts,
            };
            return Ok(Box::new(UnifiedAdapter::new(vendor, config)?));
        }

        let base_url = endpoint.ok_or_else(|| {
            Error::config(format!("profile '{}' has no endpoint configured", profile.name))
        })?;
        let config = ModelConfig {
            model_name,
            api_key,
            base_url,
            context_tokens,
            timeouts: self.config.timeouts,
        };

        tracing::info!(
            "Creating {} adapter for profile '{}' (model {})",
            vendor,
            profile.name,
            config.model_name
        );
        let adapter: Box<dyn LLMAdapter> = match vendor {
            Vendor::OpenAI => Box::new(OpenAIAdapter::new(config)?),
            Vendor::Anthropic => Box::new(AnthropicAdapter::new(config)?),
            Vendor::Google => Box::new(GoogleAdapter::new(config)?),
            Vendor::Groq => Box::new(GroqAdapter::new(config)?),
            Vendor::Ollama => Box::new(OllamaAdapter::new(config)?),
            Vendor::Custom => Box::new(UnifiedAdapter::new(vendor, config)?),
        };
        Ok(adapter)
    }

    /// Stored credentials may be ciphertext or legacy plaintext.
    fn resolve_credential(&self, stored: &str) -> String {
        if self.secrets.is_ciphertext(stored) {
            self.secrets.decrypt(stored)
        } else {
            stored.to_string()
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
