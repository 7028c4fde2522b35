use crate::services::files::content_hash;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

static ENTITY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*\.[a-z0-9][a-z0-9_-]*$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Optimization,
    Automation,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Optimization => "optimization",
            AnalysisKind::Automation => "automation",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "optimization" => Ok(AnalysisKind::Optimization),
            "automation" => Ok(AnalysisKind::Automation),
            other => Err(format!("unknown analysis kind '{}'", other)),
        }
    }
}

/// Heuristic role of a configuration file, judged from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Automations,
    Scripts,
    Scenes,
    Configuration,
    Customization,
    Groups,
    Sensors,
    Switches,
    Other,
}

impl FileKind {
    pub fn classify(path: &str) -> Self {
        let lower = path.to_lowercase();
        if lower.contains("automation") {
            FileKind::Automations
        } else if lower.contains("script") {
            FileKind::Scripts
        } else if lower.contains("scene") {
            FileKind::Scenes
        } else if lower.contains("configuration.yaml") {
            FileKind::Configuration
        } else if lower.contains("customize") {
            FileKind::Customization
        } else if lower.contains("group") {
            FileKind::Groups
        } else if lower.contains("sensor") {
            FileKind::Sensors
        } else if lower.contains("switch") {
            FileKind::Switches
        } else {
            FileKind::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Automations => "automations",
            FileKind::Scripts => "scripts",
            FileKind::Scenes => "scenes",
            FileKind::Configuration => "configuration",
            FileKind::Customization => "customization",
            FileKind::Groups => "groups",
            FileKind::Sensors => "sensors",
            FileKind::Switches => "switches",
            FileKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub kind: FileKind,
    pub content: String,
    pub content_hash: String,
    pub byte_size: usize,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        let content = content.into();
        Self {
            kind: FileKind::classify(&path),
            content_hash: content_hash(&content),
            byte_size: content.len(),
            path,
            content,
        }
    }
}

/// Files for one analysis pass, in the order they were requested.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    kind: AnalysisKind,
    files: Vec<FileEntry>,
}

impl AnalysisContext {
    /// Later duplicates of a path are dropped.
    pub fn new(kind: AnalysisKind, files: Vec<FileEntry>) -> Self {
        let mut seen = BTreeSet::new();
        let files = files
            .into_iter()
            .filter(|f| seen.insert(f.path.clone()))
            .collect();
        Self { kind, files }
    }

    pub fn kind(&self) -> AnalysisKind {
        self.kind
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Entity ids referenced anywhere in the files, sorted and unique.
    pub fn entities(&self) -> BTreeSet<String> {
        let mut entities = BTreeSet::new();
        for file in &self.files {
            match serde_yaml::from_str::<Value>(&file.content) {
                Ok(tree) => collect_entities(&tree, &mut entities),
                Err(err) => {
                    tracing::debug!("Skipping entity scan of {}: {}", file.path, err);
                }
            }
        }
        entities
    }
}

pub fn summarize_kinds(files: &[FileEntry]) -> Vec<&'static str> {
    let kinds: BTreeSet<FileKind> = files.iter().map(|f| f.kind).collect();
    kinds.into_iter().map(|k| k.as_str()).collect()
}

fn collect_entities(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if ENTITY_ID.is_match(text) {
                out.insert(text.to_string());
            }
        }
        Value::Sequence(items) => {
            for item in items {
                collect_entities(item, out);
            }
        }
        Value::Mapping(map) => {
            for item in map.values() {
                collect_entities(item, out);
            }
        }
        Value::Tagged(tagged) => collect_entities(&tagged.value, out),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}
