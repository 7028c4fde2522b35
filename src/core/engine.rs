use crate::adapters::http::preview;
use crate::adapters::llm::LLMAdapter;
use crate::config::ChunkingConfig;
use crate::core::chunker::Chunker;
use crate::core::context::{AnalysisContext, AnalysisKind, FileEntry};
use crate::core::parser::parse_suggestions;
use crate::core::prompt::PromptBuilder;
use crate::core::suggestion::SuggestionRecord;
use crate::error::{Error, FilesystemError, Result, UpstreamError};
use crate::services::files::FileStore;

/// Turns a set of configuration files into suggestions with one provider.
///
/// Each call is independent: files are read, rendered into a prompt, split
/// into chunks when the prompt does not fit the provider's context window, and
/// every chunk is sent as its own completion. Chunks run sequentially and
/// their suggestions are concatenated in chunk order.
pub struct SuggestionEngine<'a> {
    adapter: &'a dyn LLMAdapter,
    files: &'a dyn FileStore,
    chunker: Chunker,
}

impl<'a> SuggestionEngine<'a> {
    pub fn new(adapter: &'a dyn LLMAdapter, files: &'a dyn FileStore, chunking: &ChunkingConfig) -> Self {
        Self {
            adapter,
            files,
            chunker: Chunker::new(chunking),
        }
    }

    pub async fn analyze(
        &self,
        file_paths: &[String],
        scan_id: i64,
        kind: AnalysisKind,
    ) -> Result<Vec<SuggestionRecord>> {
        tracing::info!("Starting {} analysis for scan {}", kind, scan_id);

        let context = AnalysisContext::new(kind, self.read_files(file_paths).await?);
        if context.is_empty() {
            tracing::warn!("No readable files for {} analysis of scan {}", kind, scan_id);
            return Ok(Vec::new());
        }

        let mut builder = PromptBuilder::new(kind, self.adapter.model_name());
        if kind == AnalysisKind::Automation {
            let entities = context.entities();
            tracing::debug!("Found {} entities for automation prompt", entities.len());
            builder = builder.with_entities(entities);
        }

        let chunks = self.plan_chunks(&builder, context.files());
        let total = chunks.len();
        let mut suggestions = Vec::new();
        let mut last_upstream: Option<UpstreamError> = None;
        let mut delivered = 0usize;

        for (index, chunk) in chunks.iter().enumerate() {
            tracing::info!("Processing chunk {}/{} for scan {}", index + 1, total, scan_id);
            let response = match self.adapter.generate(&builder.messages(chunk)).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::error!("Chunk {}/{} failed: {}", index + 1, total, err);
                    last_upstream = Some(err);
                    continue;
                }
            };
            delivered += 1;
            tracing::info!(
                "Received response for chunk {}/{}: {}",
                index + 1,
                total,
                preview(&response.content, 200)
            );

            match parse_suggestions(&response.content, kind) {
                Ok(parsed) => suggestions.extend(
                    parsed
                        .into_iter()
                        .map(|item| SuggestionRecord::from_parsed(scan_id, item)),
                ),
                Err(err) => {
                    tracing::error!("Failed to parse {} response: {}", kind, err);
                    tracing::error!("Raw LLM response: {}", response.content);
                }
            }
        }

        // No chunk reached the model.
        if delivered == 0 {
            if let Some(err) = last_upstream {
                return Err(err.into());
            }
        }

        tracing::info!(
            "Generated {} {} suggestions for scan {}",
            suggestions.len(),
            kind,
            scan_id
        );
        Ok(suggestions)
    }

    /// Missing files are skipped; any other read failure aborts the analysis.
    async fn read_files(&self, file_paths: &[String]) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::with_capacity(file_paths.len());
        for path in file_paths {
            match self.files.read(path).await {
                Ok(content) => entries.push(FileEntry::new(path.clone(), content)),
                Err(FilesystemError::NotFound(missing)) => {
                    tracing::warn!("Skipping missing file {}", missing.display());
                }
                Err(err) => return Err(Error::Filesystem(err)),
            }
        }
        Ok(entries)
    }

    /// The user prompts to send: the whole file set when it fits within the
    /// chunker's threshold, otherwise chunks sized to what the system prompt
    /// leaves of the context window.
    fn plan_chunks(&self, builder: &PromptBuilder, files: &[FileEntry]) -> Vec<String> {
        let budget = self
            .adapter
            .context_tokens()
            .saturating_sub(self.adapter.estimate_tokens(builder.system_prompt()))
            .max(1);

        let full = builder.render(files);
        if self.adapter.estimate_tokens(&full) <= self.chunker.threshold(budget) {
            return vec![full];
        }

        let chunks = self.chunker.chunk(
            files,
            budget,
            |batch| builder.render(batch),
            |text| self.adapter.estimate_tokens(text),
        );
        tracing::info!(
            "Prompt exceeds {} of {} tokens; split into {} chunks",
            self.chunker.threshold(budget),
            budget,
            chunks.len()
        );
        for (index, chunk) in chunks.iter().enumerate() {
            let request = format!("{}\n{}", builder.system_prompt(), chunk);
            if !self.adapter.can_handle_context(&request) {
                tracing::warn!(
                    "Chunk {}/{} exceeds the {} token context window of {}",
                    index + 1,
                    chunks.len(),
                    self.adapter.context_tokens(),
                    self.adapter.model_name()
                );
            }
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::llm::{estimate_tokens, Role};
    use crate::adapters::testing::ScriptedAdapter;
    use crate::core::suggestion::{Impact, SuggestionDetails};
    use crate::error::ErrorCategory;
    use crate::services::files::LocalFileStore;
    use tempfile::TempDir;

    fn config_dir(files: &[(&str, String)]) -> (TempDir, LocalFileStore) {
        let dir = tempfile::Builder::new().prefix("ha-config").tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let store = LocalFileStore::new(dir.path());
        (dir, store)
    }

    fn paths(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn chunking() -> ChunkingConfig {
        ChunkingConfig {
            safety_factor: 0.75,
            text_overlap_chars: 100,
        }
    }

    #[tokio::test]
    async fn commentary_wrapped_reply_yields_one_suggestion() {
        let (_dir, files) = config_dir(&[("automations.yaml", "- alias: test\n".to_string())]);
        let adapter =
            ScriptedAdapter::replying(&["Here you go:\n[{\"title\":\"Fix X\"}]\nhope that helps"]);
        let engine = SuggestionEngine::new(&adapter, &files, &chunking());

        let suggestions = engine
            .analyze(&paths(&["automations.yaml"]), 9, AnalysisKind::Optimization)
            .await
            .unwrap();

        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].title, "Fix X");
        assert_eq!(suggestions[0].impact, Impact::Medium);
        assert_eq!(suggestions[0].scan_id, 9);

        let requests = adapter.requests.lock().unwrap();
        assert_eq!(requests[0][0].role, Role::System);
        assert!(requests[0][1].content.contains("### automations.yaml (automations)"));
    }

    #[tokio::test]
    async fn unparseable_reply_yields_nothing() {
        let (_dir, files) = config_dir(&[("configuration.yaml", "homeassistant:\n".to_string())]);
        let adapter = ScriptedAdapter::replying(&["not json at all"]);
        let engine = SuggestionEngine::new(&adapter, &files, &chunking());

        let suggestions = engine
            .analyze(&paths(&["configuration.yaml"]), 1, AnalysisKind::Optimization)
            .await
            .unwrap();
        assert!(suggestions.is_empty());
    }

    #[tokio::test]
    async fn oversized_prompt_is_sent_in_chunks() {
        let body = |prefix: &str| -> String {
            (0..40).map(|i| format!("{}_{}: value\n", prefix, i)).collect()
        };
        let (_dir, files) = config_dir(&[
            ("a.yaml", body("alpha")),
            ("b.yaml", body("bravo")),
            ("c.yaml", body("charlie")),
        ]);
        let adapter = ScriptedAdapter::replying(&[
            r#"[{"title": "one"}]"#,
            r#"not json"#,
            r#"[{"title": "three"}]"#,
        ])
        .with_context_tokens(700);
        let engine = SuggestionEngine::new(&adapter, &files, &chunking());

        let suggestions = engine
            .analyze(&paths(&["a.yaml", "b.yaml", "c.yaml"]), 2, AnalysisKind::Optimization)
            .await
            .unwrap();

        let requests = adapter.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        let system = estimate_tokens(&requests[0][0].content);
        for request in requests.iter() {
            assert!(system + estimate_tokens(&request[1].content) <= 700);
        }
        assert!(requests[0][1].content.contains("alpha_0"));
        assert!(requests[2][1].content.contains("charlie_0"));

        let titles: Vec<&str> = suggestions.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["one", "three"]);
    }

    #[tokio::test]
    async fn prompt_just_under_the_window_is_chunked() {
        let body = |prefix: &str| -> String {
            (0..60).map(|i| format!("{}_{}: value\n", prefix, i)).collect()
        };
        let entries = vec![
            FileEntry::new("a.yaml", body("alpha")),
            FileEntry::new("b.yaml", body("bravo")),
        ];
        let builder = PromptBuilder::new(AnalysisKind::Optimization, "scripted");
        let system = estimate_tokens(builder.system_prompt());
        let full = estimate_tokens(&builder.render(&entries));
        let context = system + full + 2;

        let (_dir, files) = config_dir(&[("a.yaml", body("alpha")), ("b.yaml", body("bravo"))]);
        let adapter = ScriptedAdapter::replying(&["[]", "[]"]).with_context_tokens(context);
        let engine = SuggestionEngine::new(&adapter, &files, &chunking());

        engine
            .analyze(&paths(&["a.yaml", "b.yaml"]), 6, AnalysisKind::Optimization)
            .await
            .unwrap();

        let requests = adapter.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let threshold = ((context - system) as f64 * 0.75).floor() as usize;
        for request in requests.iter() {
            assert!(estimate_tokens(&request[1].content) <= threshold);
        }
        assert!(requests[0][1].content.contains("alpha_0"));
        assert!(requests[1][1].content.contains("bravo_0"));
    }

    #[tokio::test]
    async fn oversized_file_is_sent_whole_and_alone() {
        let huge: String = (0..400).map(|i| format!("sensor_{}: value\n", i)).collect();
        let (_dir, files) = config_dir(&[
            ("groups.yaml", "kitchen: {}\n".to_string()),
            ("sensors.yaml", huge.clone()),
            ("scenes.yaml", "- name: Movie\n".to_string()),
        ]);
        let system = estimate_tokens(
            PromptBuilder::new(AnalysisKind::Optimization, "scripted").system_prompt(),
        );
        let adapter = ScriptedAdapter::replying(&["[]", "[]", "[]"]).with_context_tokens(system + 400);
        let engine = SuggestionEngine::new(&adapter, &files, &chunking());

        engine
            .analyze(
                &paths(&["groups.yaml", "sensors.yaml", "scenes.yaml"]),
                7,
                AnalysisKind::Optimization,
            )
            .await
            .unwrap();

        let requests = adapter.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0][1].content.contains("### groups.yaml"));
        assert!(requests[1][1].content.contains(huge.trim_end()));
        assert!(!requests[1][1].content.contains("groups.yaml"));
        assert!(requests[2][1].content.contains("### scenes.yaml"));
    }

    #[tokio::test]
    async fn missing_files_are_skipped() {
        let (_dir, files) = config_dir(&[("scenes.yaml", "- name: Movie\n".to_string())]);
        let adapter = ScriptedAdapter::replying(&["[]"]);
        let engine = SuggestionEngine::new(&adapter, &files, &chunking());

        engine
            .analyze(&paths(&["gone.yaml", "scenes.yaml"]), 3, AnalysisKind::Optimization)
            .await
            .unwrap();

        let requests = adapter.requests.lock().unwrap();
        assert!(!requests[0][1].content.contains("gone.yaml"));
        assert!(requests[0][1].content.contains("scenes.yaml"));
    }

    #[tokio::test]
    async fn no_readable_files_means_no_calls() {
        let (_dir, files) = config_dir(&[]);
        let adapter = ScriptedAdapter::replying(&[]);
        let engine = SuggestionEngine::new(&adapter, &files, &chunking());

        let suggestions = engine
            .analyze(&paths(&["gone.yaml"]), 3, AnalysisKind::Automation)
            .await
            .unwrap();
        assert!(suggestions.is_empty());
        assert_eq!(adapter.request_count(), 0);
    }

    #[tokio::test]
    async fn automation_prompt_lists_entities() {
        let (_dir, files) = config_dir(&[(
            "automations.yaml",
            "- trigger:\n    entity_id: binary_sensor.door\n  action:\n    service: light.turn_on\n".to_string(),
        )]);
        let adapter = ScriptedAdapter::replying(&[
            r#"[{"title": "Door light", "yaml": "alias: Door light", "entities_used": "binary_sensor.door, light.hall"}]"#,
        ]);
        let engine = SuggestionEngine::new(&adapter, &files, &chunking());

        let suggestions = engine
            .analyze(&paths(&["automations.yaml"]), 4, AnalysisKind::Automation)
            .await
            .unwrap();

        let requests = adapter.requests.lock().unwrap();
        assert!(requests[0][1].content.contains("- binary_sensor.door"));
        match &suggestions[0].details {
            SuggestionDetails::Automation { entities_used, .. } => {
                assert_eq!(entities_used, &vec!["binary_sensor.door", "light.hall"]);
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[tokio::test]
    async fn all_chunks_failing_upstream_is_an_error() {
        let (_dir, files) = config_dir(&[("groups.yaml", "kitchen: {}\n".to_string())]);
        let adapter = ScriptedAdapter::new(vec![Err(UpstreamError::new(
            "scripted",
            ErrorCategory::RateLimit,
            "slow down",
        ))]);
        let engine = SuggestionEngine::new(&adapter, &files, &chunking());

        let err = engine
            .analyze(&paths(&["groups.yaml"]), 5, AnalysisKind::Optimization)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Upstream(UpstreamError {
                category: ErrorCategory::RateLimit,
                ..
            })
        ));
    }
}
