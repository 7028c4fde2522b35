use crate::core::context::AnalysisKind;
use crate::core::parser::ParsedSuggestion;
use crate::error::{Error, Result};
use crate::services::files::FileStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    High,
    Medium,
    Low,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Impact::High => "high",
            Impact::Medium => "medium",
            Impact::Low => "low",
        }
    }
}

impl FromStr for Impact {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" => Ok(Impact::High),
            "medium" => Ok(Impact::Medium),
            "low" => Ok(Impact::Low),
            other => Err(format!("unknown impact '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Rejected,
    Applied,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Applied => "applied",
        }
    }

    /// Status only moves forward; rejected and applied are terminal.
    pub fn can_transition_to(&self, next: SuggestionStatus) -> bool {
        matches!(
            (self, next),
            (SuggestionStatus::Pending, SuggestionStatus::Accepted)
                | (SuggestionStatus::Pending, SuggestionStatus::Rejected)
                | (SuggestionStatus::Accepted, SuggestionStatus::Applied)
        )
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific payload of a suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SuggestionDetails {
    Optimization {
        file_path: Option<String>,
        before: Option<String>,
        after: Option<String>,
        reasoning: Option<String>,
    },
    Automation {
        trigger: Option<String>,
        condition: Option<String>,
        action: Option<String>,
        yaml: Option<String>,
        #[serde(default)]
        entities_used: Vec<String>,
    },
}

impl SuggestionDetails {
    pub fn kind(&self) -> AnalysisKind {
        match self {
            SuggestionDetails::Optimization { .. } => AnalysisKind::Optimization,
            SuggestionDetails::Automation { .. } => AnalysisKind::Automation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionRecord {
    #[serde(default)]
    pub id: i64,
    pub scan_id: i64,
    pub title: String,
    pub body_md: String,
    pub impact: Impact,
    pub status: SuggestionStatus,
    pub category: Option<String>,
    pub details: SuggestionDetails,
    /// Fields the model left out that were filled with defaults.
    #[serde(default)]
    pub defaulted: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl SuggestionRecord {
    pub fn from_parsed(scan_id: i64, parsed: ParsedSuggestion) -> Self {
        let body_md = render_body(&parsed.description, &parsed.details);
        Self {
            id: 0,
            scan_id,
            title: parsed.title,
            body_md,
            impact: parsed.impact,
            status: SuggestionStatus::Pending,
            category: parsed.category,
            details: parsed.details,
            defaulted: parsed.defaulted.into_iter().map(str::to_string).collect(),
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> AnalysisKind {
        self.details.kind()
    }

    pub fn transition(&mut self, next: SuggestionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Unified diff of the proposed change, if this suggestion carries one.
    pub fn unified_diff(&self) -> Option<String> {
        let SuggestionDetails::Optimization {
            file_path,
            before: Some(before),
            after: Some(after),
            ..
        } = &self.details
        else {
            return None;
        };
        let name = file_path.as_deref().unwrap_or("configuration");
        let diff = TextDiff::from_lines(with_newline(before).as_str(), with_newline(after).as_str())
            .unified_diff()
            .context_radius(3)
            .header(&format!("a/{}", name), &format!("b/{}", name))
            .to_string();
        Some(diff)
    }
}

fn with_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\n", text)
    }
}

fn render_body(description: &str, details: &SuggestionDetails) -> String {
    let mut parts = vec![description.to_string()];
    match details {
        SuggestionDetails::Optimization {
            before,
            after,
            reasoning,
            ..
        } => {
            if let Some(reasoning) = reasoning {
                parts.extend(["".to_string(), "**Why this helps:**".to_string(), reasoning.clone()]);
            }
            if let (Some(before), Some(after)) = (before, after) {
                parts.extend(
                    [
                        "",
                        "**Current configuration:**",
                        "```yaml",
                        before.trim_end(),
                        "```",
                        "",
                        "**Improved configuration:**",
                        "```yaml",
                        after.trim_end(),
                        "```",
                    ]
                    .map(str::to_string),
                );
            }
        }
        SuggestionDetails::Automation {
            trigger,
            condition,
            action,
            yaml,
            ..
        } => {
            if let Some(trigger) = trigger {
                parts.push(String::new());
                parts.push(format!("**Trigger:** {}", trigger));
            }
            if let Some(condition) = condition {
                parts.push(format!("**Condition:** {}", condition));
            }
            if let Some(action) = action {
                parts.push(format!("**Action:** {}", action));
            }
            if let Some(yaml) = yaml {
                parts.extend(
                    ["", "**Automation YAML:**", "```yaml", yaml.trim_end(), "```"].map(str::to_string),
                );
            }
        }
    }
    parts.join("\n")
}

fn validate_yaml(label: &str, text: &str) -> Result<()> {
    serde_yaml::from_str::<serde_yaml::Value>(text)
        .map(|_| ())
        .map_err(|err| Error::Apply(format!("{} is not valid YAML: {}", label, err)))
}

/// Writes an accepted optimization back to its file and marks it applied.
///
/// The `before` snippet must occur verbatim in the target file; only its
/// first occurrence is replaced. The file is written only if the result
/// still parses as YAML.
pub async fn apply_suggestion(record: &mut SuggestionRecord, files: &dyn FileStore) -> Result<()> {
    if record.status != SuggestionStatus::Accepted {
        return Err(Error::InvalidTransition {
            from: record.status.to_string(),
            to: SuggestionStatus::Applied.to_string(),
        });
    }

    let SuggestionDetails::Optimization {
        file_path: Some(file_path),
        before: Some(before),
        after: Some(after),
        ..
    } = &record.details
    else {
        return Err(Error::Apply(
            "suggestion has no target file with before/after content".to_string(),
        ));
    };

    validate_yaml("before snippet", before)?;
    validate_yaml("after snippet", after)?;

    let current = files.read(file_path).await?;
    let Some(position) = current.find(before.as_str()) else {
        return Err(Error::Apply(format!(
            "current content of {} does not contain the before snippet",
            file_path
        )));
    };

    let mut updated = String::with_capacity(current.len() + after.len());
    updated.push_str(&current[..position]);
    updated.push_str(after);
    updated.push_str(&current[position + before.len()..]);
    validate_yaml(file_path, &updated)?;

    files.write(file_path, &updated).await?;
    tracing::info!("Applied suggestion {} to {}", record.id, file_path);
    record.transition(SuggestionStatus::Applied)
}
