use crate::adapters::llm::Message;
use crate::adapters::openai::is_reasoning_model;
use crate::core::context::{summarize_kinds, AnalysisKind, FileEntry};
use std::collections::{BTreeMap, BTreeSet};

const ENTITIES_PER_DOMAIN: usize = 10;

const OPTIMIZATION_SYSTEM_PROMPT: &str = r#"You are an expert Home Assistant configuration analyst. Your job is to analyze YAML configuration files and suggest specific optimizations.

For each suggestion, provide a JSON object with these fields:
- "title": Brief, clear title of the optimization
- "description": Detailed explanation of the issue and proposed fix
- "impact": "high", "medium", or "low" based on performance/maintainability impact
- "category": "performance", "maintainability", "best_practices", "security", or "deprecated"
- "file_path": The specific file that needs changes
- "before": YAML snippet showing current problematic code
- "after": YAML snippet showing the improved version
- "reasoning": Why this change improves the configuration

Focus on actionable, specific suggestions. Avoid generic advice. Always include exact YAML snippets for before/after comparisons. The "before" snippet must be copied verbatim from the file.

Respond only with a valid JSON array of suggestion objects, no other text."#;

const CONCISE_OPTIMIZATION_SYSTEM_PROMPT: &str = r#"You are a Home Assistant expert. Find problems in the YAML and suggest fixes.

Return a JSON array with suggestions. Each suggestion needs:
- "title": What to fix
- "description": How to fix it
- "impact": "high", "medium", or "low"
- "category": "performance" or "maintainability"
- "file_path": Which file to change
- "before": Current YAML, copied verbatim
- "after": Fixed YAML
- "reasoning": Why fix this

Only return valid JSON, nothing else."#;

const AUTOMATION_SYSTEM_PROMPT: &str = r#"You are an expert Home Assistant automation designer. Your job is to suggest practical, useful automations based on available entities.

For each automation suggestion, provide a JSON object with these fields:
- "title": Clear, descriptive automation name
- "description": What the automation does and why it's useful
- "impact": "high", "medium", or "low" based on usefulness
- "category": "lighting", "climate", "security", "energy", "convenience", or "monitoring"
- "trigger": Description of what triggers the automation
- "condition": Any conditions that must be met
- "action": What actions are performed
- "yaml": Complete YAML automation configuration
- "entities_used": List of entity IDs referenced in the automation

Only suggest automations that:
1. Use entities that actually exist in the configuration
2. Follow Home Assistant best practices
3. Provide clear value to the user
4. Are safe and won't cause issues

Respond only with a valid JSON array of automation suggestion objects, no other text."#;

/// Renders role-tagged prompts for one analysis kind.
pub struct PromptBuilder {
    kind: AnalysisKind,
    concise: bool,
    entities: BTreeSet<String>,
}

impl PromptBuilder {
    /// Reasoning-tier models get the shorter system prompt.
    pub fn new(kind: AnalysisKind, model_name: &str) -> Self {
        Self {
            kind,
            concise: is_reasoning_model(model_name),
            entities: BTreeSet::new(),
        }
    }

    /// Entities listed in automation prompts. Ignored for optimization.
    pub fn with_entities(mut self, entities: BTreeSet<String>) -> Self {
        self.entities = entities;
        self
    }

    pub fn system_prompt(&self) -> &'static str {
        match self.kind {
            AnalysisKind::Optimization if self.concise => CONCISE_OPTIMIZATION_SYSTEM_PROMPT,
            AnalysisKind::Optimization => OPTIMIZATION_SYSTEM_PROMPT,
            AnalysisKind::Automation => AUTOMATION_SYSTEM_PROMPT,
        }
    }

    pub fn messages(&self, user_prompt: &str) -> Vec<Message> {
        vec![
            Message::system(self.system_prompt()),
            Message::user(user_prompt),
        ]
    }

    /// The user prompt for `files`; also the unit the chunker measures.
    pub fn render(&self, files: &[FileEntry]) -> String {
        let mut parts: Vec<String> = Vec::new();
        match self.kind {
            AnalysisKind::Optimization => {
                parts.push("# Home Assistant Configuration Analysis Request".to_string());
            }
            AnalysisKind::Automation => {
                parts.push("# Home Assistant Automation Suggestions Request".to_string());
                parts.push(String::new());
                self.render_entities(&mut parts);
            }
        }

        let total_size: usize = files.iter().map(|f| f.byte_size).sum();
        parts.extend([
            String::new(),
            "## Summary".to_string(),
            format!("- Total files: {}", files.len()),
            format!("- File types: {}", summarize_kinds(files).join(", ")),
            format!("- Total size: {} bytes", total_size),
            String::new(),
            "## Files to Analyze".to_string(),
            String::new(),
        ]);

        for file in files {
            parts.push(format!("### {} ({})", file.path, file.kind.as_str()));
            parts.push("```yaml".to_string());
            parts.push(file.content.trim_end().to_string());
            parts.push("```".to_string());
            parts.push(String::new());
        }

        match self.kind {
            AnalysisKind::Optimization => parts.extend(
                [
                    "## Analysis Request",
                    "Please analyze the above Home Assistant configuration files and provide optimization suggestions.",
                    "Focus on:",
                    "1. Performance improvements",
                    "2. Code simplification and cleanup",
                    "3. Best practices and conventions",
                    "4. Deprecated or outdated patterns",
                    "5. Redundant or inefficient configurations",
                    "",
                    "Format your response as a JSON array of suggestion objects.",
                ]
                .map(str::to_string),
            ),
            AnalysisKind::Automation => parts.extend(
                [
                    "## Request",
                    "Based on the available entities, suggest useful automations that would improve the smart home experience.",
                    "Consider common automation patterns like:",
                    "- Lighting automation based on presence/time",
                    "- Climate control optimization",
                    "- Security and monitoring",
                    "- Energy efficiency",
                    "- Convenience automations",
                    "",
                    "Format your response as a JSON array of automation suggestion objects.",
                ]
                .map(str::to_string),
            ),
        }

        parts.join("\n")
    }

    fn render_entities(&self, parts: &mut Vec<String>) {
        parts.push("## Available Entities".to_string());
        parts.push(format!(
            "Found {} entities across your configuration:",
            self.entities.len()
        ));
        parts.push(String::new());

        let mut by_domain: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for entity in &self.entities {
            let domain = entity.split('.').next().unwrap_or("unknown");
            by_domain.entry(domain).or_default().push(entity);
        }

        for (domain, entities) in by_domain {
            parts.push(format!("### {} ({} entities)", title_case(domain), entities.len()));
            for entity in entities.iter().take(ENTITIES_PER_DOMAIN) {
                parts.push(format!("- {}", entity));
            }
            if entities.len() > ENTITIES_PER_DOMAIN {
                parts.push(format!("- ... and {} more", entities.len() - ENTITIES_PER_DOMAIN));
            }
            parts.push(String::new());
        }
    }
}

fn title_case(domain: &str) -> String {
    domain
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join("_")
}
