use crate::core::context::AnalysisKind;
use crate::core::suggestion::{Impact, SuggestionDetails};
use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// One suggestion read from model output, with the names of any fields that
/// had to be filled with defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSuggestion {
    pub title: String,
    pub description: String,
    pub impact: Impact,
    pub category: Option<String>,
    pub details: SuggestionDetails,
    pub defaulted: Vec<&'static str>,
}

/// Reads the suggestion array out of a model reply.
///
/// Commentary around the JSON is tolerated. Elements that are not objects
/// are skipped; missing fields get defaults. A reply with no decodable array
/// is a [`Error::Parse`].
pub fn parse_suggestions(raw: &str, kind: AnalysisKind) -> Result<Vec<ParsedSuggestion>> {
    let items = extract_array(raw).ok_or_else(|| {
        Error::Parse(format!(
            "no JSON array found in {} chars of model output",
            raw.chars().count()
        ))
    })?;

    let mut suggestions = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Object(fields) => suggestions.push(parse_item(&fields, kind)),
            other => tracing::debug!("Skipping non-object suggestion element: {}", other),
        }
    }
    Ok(suggestions)
}

/// Finds the first bracketed span that decodes as a JSON array, preferring
/// one that holds at least one object. Falls back to the widest span, then
/// to the whole text.
pub fn extract_array(raw: &str) -> Option<Vec<Value>> {
    let mut first_plain: Option<Vec<Value>> = None;

    for (start, _) in raw.match_indices('[') {
        let Some(end) = matching_bracket(raw, start) else {
            continue;
        };
        if let Ok(items) = serde_json::from_str::<Vec<Value>>(&raw[start..=end]) {
            if items.iter().any(Value::is_object) {
                return Some(items);
            }
            if first_plain.is_none() {
                first_plain = Some(items);
            }
        }
    }
    if first_plain.is_some() {
        return first_plain;
    }

    if let (Some(start), Some(end)) = (raw.find('['), raw.rfind(']')) {
        if start < end {
            if let Ok(items) = serde_json::from_str::<Vec<Value>>(&raw[start..=end]) {
                return Some(items);
            }
        }
    }
    serde_json::from_str::<Vec<Value>>(raw.trim()).ok()
}

/// Byte index of the `]` closing the `[` at `open`, skipping string contents.
fn matching_bracket(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[open..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_item(fields: &Map<String, Value>, kind: AnalysisKind) -> ParsedSuggestion {
    let mut defaulted = Vec::new();

    let title = match text_field(fields, "title") {
        Some(title) => title,
        None => {
            defaulted.push("title");
            match kind {
                AnalysisKind::Optimization => "Optimization Suggestion".to_string(),
                AnalysisKind::Automation => "Automation Suggestion".to_string(),
            }
        }
    };

    let description = text_field(fields, "description").unwrap_or_else(|| {
        defaulted.push("description");
        String::new()
    });

    let impact = match text_field(fields, "impact").and_then(|s| s.parse::<Impact>().ok()) {
        Some(impact) => impact,
        None => {
            defaulted.push("impact");
            Impact::Medium
        }
    };

    let mut optional = |name: &'static str| {
        let value = text_field(fields, name);
        if value.is_none() {
            defaulted.push(name);
        }
        value
    };

    let category = optional("category");
    let details = match kind {
        AnalysisKind::Optimization => SuggestionDetails::Optimization {
            file_path: optional("file_path"),
            before: optional("before"),
            after: optional("after"),
            reasoning: optional("reasoning"),
        },
        AnalysisKind::Automation => {
            let trigger = optional("trigger");
            let condition = optional("condition");
            let action = optional("action");
            let yaml = yaml_field(fields, "yaml");
            if yaml.is_none() {
                defaulted.push("yaml");
            }
            let entities_used = string_list(fields.get("entities_used"));
            if entities_used.is_none() {
                defaulted.push("entities_used");
            }
            SuggestionDetails::Automation {
                trigger,
                condition,
                action,
                yaml,
                entities_used: entities_used.unwrap_or_default(),
            }
        }
    };

    ParsedSuggestion {
        title,
        description,
        impact,
        category,
        details,
        defaulted,
    }
}

/// A non-empty string, or a compact rendering of a structured value.
fn text_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Models sometimes send the automation as an object instead of a YAML string.
fn yaml_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        value @ (Value::Object(_) | Value::Array(_)) => serde_yaml::to_string(value).ok(),
        _ => text_field(fields, name),
    }
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
        ),
        Value::String(s) if !s.trim().is_empty() => Some(
            s.split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commentary_around_the_array_is_tolerated() {
        let raw = "Here you go:\n[{\"title\":\"Fix X\"}]\nhope that helps";
        let parsed = parse_suggestions(raw, AnalysisKind::Optimization).unwrap();

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].title, "Fix X");
        assert_eq!(parsed[0].impact, Impact::Medium);
        assert!(parsed[0].defaulted.contains(&"impact"));
        assert!(!parsed[0].defaulted.contains(&"title"));
    }

    #[test]
    fn plain_prose_is_a_parse_error() {
        assert!(matches!(
            parse_suggestions("not json at all", AnalysisKind::Optimization),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn non_object_elements_are_skipped() {
        let raw = r#"[1, "two", {"impact": "HIGH"}, null]"#;
        let parsed = parse_suggestions(raw, AnalysisKind::Automation).unwrap();

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].title, "Automation Suggestion");
        assert_eq!(parsed[0].impact, Impact::High);
        assert!(parsed[0].defaulted.contains(&"title"));
    }

    #[test]
    fn brackets_inside_strings_do_not_confuse_extraction() {
        let raw = r#"Notes [see below]: [{"title": "Use [brackets] \"safely\"", "before": "a: [1, 2]"}] done ]"#;
        let parsed = parse_suggestions(raw, AnalysisKind::Optimization).unwrap();

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].title, r#"Use [brackets] "safely""#);
        match &parsed[0].details {
            SuggestionDetails::Optimization { before, .. } => {
                assert_eq!(before.as_deref(), Some("a: [1, 2]"));
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn fenced_json_block_is_extracted() {
        let raw = "```json\n[\n  {\"title\": \"Merge sensors\", \"impact\": \"low\", \"category\": \"maintainability\"}\n]\n```";
        let parsed = parse_suggestions(raw, AnalysisKind::Optimization).unwrap();
        assert_eq!(parsed[0].impact, Impact::Low);
        assert_eq!(parsed[0].category.as_deref(), Some("maintainability"));
    }

    #[test]
    fn automation_fields_accept_structured_values() {
        let raw = r#"[{
            "title": "Night lights",
            "trigger": {"platform": "sun", "event": "sunset"},
            "yaml": {"alias": "Night lights", "action": [{"service": "light.turn_on"}]},
            "entities_used": ["light.porch", 3, "sun.sun"]
        }]"#;
        let parsed = parse_suggestions(raw, AnalysisKind::Automation).unwrap();

        match &parsed[0].details {
            SuggestionDetails::Automation {
                trigger,
                yaml,
                entities_used,
                condition,
                ..
            } => {
                assert!(trigger.as_deref().unwrap().contains("sunset"));
                assert!(yaml.as_deref().unwrap().contains("alias: Night lights"));
                assert_eq!(entities_used, &vec!["light.porch".to_string(), "sun.sun".to_string()]);
                assert!(condition.is_none());
            }
            other => panic!("unexpected details {:?}", other),
        }
        assert!(parsed[0].defaulted.contains(&"condition"));
        assert!(!parsed[0].defaulted.contains(&"entities_used"));
    }

    #[test]
    fn empty_array_yields_no_suggestions() {
        assert!(parse_suggestions("[]", AnalysisKind::Optimization)
            .unwrap()
            .is_empty());
    }
}
