use crate::adapters::llm::{ProviderProfile, Vendor};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the Home Assistant configuration tree.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// JSON snapshot for scans, suggestions, profiles and settings.
    #[serde(default)]
    pub data_file: Option<PathBuf>,

    #[serde(default = "default_includes")]
    pub yaml_includes: Vec<String>,

    #[serde(default = "default_excludes")]
    pub yaml_excludes: Vec<String>,

    /// Environment-level defaults per vendor, used when a profile leaves a field empty.
    #[serde(default)]
    pub vendors: BTreeMap<Vendor, VendorDefaults>,

    /// When set, every profile is routed through this OpenAI-compatible proxy.
    pub proxy_url: Option<String>,

    #[serde(default = "default_proxy_api_key")]
    pub proxy_api_key: String,

    pub encryption_key: Option<String>,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub profiles: Vec<ProviderProfile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VendorDefaults {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub context_tokens: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,

    #[serde(default = "default_stream_secs")]
    pub stream_secs: u64,

    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,

    /// Local inference is slow; this bounds every Ollama call.
    #[serde(default = "default_local_secs")]
    pub local_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            stream_secs: default_stream_secs(),
            probe_secs: default_probe_secs(),
            local_secs: default_local_secs(),
        }
    }
}

impl Timeouts {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn stream(&self) -> Duration {
        Duration::from_secs(self.stream_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn local(&self) -> Duration {
        Duration::from_secs(self.local_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Share of the context window a chunk may fill; the rest is left for the reply.
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,

    #[serde(default = "default_overlap_chars")]
    pub text_overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            safety_factor: default_safety_factor(),
            text_overlap_chars: default_overlap_chars(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            data_file: None,
            yaml_includes: default_includes(),
            yaml_excludes: default_excludes(),
            vendors: BTreeMap::new(),
            proxy_url: None,
            proxy_api_key: default_proxy_api_key(),
            encryption_key: None,
            timeouts: Timeouts::default(),
            chunking: ChunkingConfig::default(),
            profiles: Vec::new(),
        }
    }
}

impl Config {
    /// Discovers the config file, falling back to defaults when none exists.
    pub fn load() -> Result<Self> {
        for candidate in [".ha-optimizer.yml", ".ha-optimizer.yaml"] {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".ha-optimizer.yml");
            if home_config.exists() {
                return Self::from_file(&home_config);
            }
        }

        Ok(Config::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Overlays process environment variables. Called once at startup.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        for vendor in [Vendor::OpenAI, Vendor::Anthropic, Vendor::Google, Vendor::Groq, Vendor::Ollama] {
            let prefix = vendor.as_str().to_uppercase();
            let api_key = var(&format!("{}_API_KEY", prefix));
            let endpoint = var(&format!("{}_BASE_URL", prefix));
            let model = var(&format!("{}_MODEL", prefix));
            let context_tokens = var(&format!("{}_MAX_TOKENS", prefix)).and_then(|v| v.parse().ok());

            if api_key.is_none() && endpoint.is_none() && model.is_none() && context_tokens.is_none() {
                continue;
            }
            let defaults = self.vendors.entry(vendor).or_default();
            if api_key.is_some() {
                defaults.api_key = api_key;
            }
            if endpoint.is_some() {
                defaults.endpoint = endpoint;
            }
            if model.is_some() {
                defaults.model = model;
            }
            if context_tokens.is_some() {
                defaults.context_tokens = context_tokens;
            }
        }

        if let Some(path) = var("CONFIG_PATH") {
            self.config_path = PathBuf::from(path);
        }
        if let Some(key) = var("ENCRYPTION_KEY") {
            self.encryption_key = Some(key);
        }
        if let Some(url) = var("LITELLM_PROXY_URL") {
            self.proxy_url = Some(url);
        }
        if let Some(key) = var("LITELLM_PROXY_API_KEY") {
            self.proxy_api_key = key;
        }
    }

    pub fn vendor_defaults(&self, vendor: Vendor) -> VendorDefaults {
        self.vendors.get(&vendor).cloned().unwrap_or_default()
    }
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/config")
}

fn default_includes() -> Vec<String> {
    vec!["*.yaml".to_string(), "*.yml".to_string()]
}

fn default_excludes() -> Vec<String> {
    vec!["secrets.yaml".to_string(), "known_devices.yaml".to_string()]
}

fn default_proxy_api_key() -> String {
    "sk-1234".to_string()
}

fn default_request_secs() -> u64 {
    60
}

fn default_stream_secs() -> u64 {
    120
}

fn default_probe_secs() -> u64 {
    30
}

fn default_local_secs() -> u64 {
    300
}

fn default_safety_factor() -> f64 {
    0.75
}

fn default_overlap_chars() -> usize {
    100
}
