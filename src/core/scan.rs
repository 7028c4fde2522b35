use crate::adapters::factory::ProviderFactory;
use crate::adapters::llm::{LLMAdapter, ProviderProfile};
use crate::config::Config;
use crate::core::context::AnalysisKind;
use crate::core::engine::SuggestionEngine;
use crate::core::suggestion::SuggestionRecord;
use crate::error::{Error, Result};
use crate::services::files::{filter_paths, FileStore};
use crate::services::notify::{NotificationSink, ScanEvent};
use crate::services::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const INCLUDES_SETTING: &str = "yaml_includes";
pub const EXCLUDES_SETTING: &str = "yaml_excludes";

const DEFAULT_KINDS: &[AnalysisKind] = &[AnalysisKind::Optimization];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub file_count: usize,
    pub profile_id: Option<i64>,
    pub suggestion_count: usize,
    /// Why the scan failed, or which analysis kinds failed in a completed scan.
    pub diagnostic: Option<String>,
}

/// Builds an adapter for a profile. [`ProviderFactory`] is the production source.
pub trait AdapterSource: Send + Sync {
    fn adapter_for(&self, profile: &ProviderProfile) -> Result<Box<dyn LLMAdapter>>;
}

impl AdapterSource for ProviderFactory {
    fn adapter_for(&self, profile: &ProviderProfile) -> Result<Box<dyn LLMAdapter>> {
        self.create(profile)
    }
}

/// Drives scans from `pending` to a terminal status.
///
/// `start` is a plain async function; callers decide whether to await it
/// inline or spawn it. Cancellation only marks the record failed and is
/// noticed between analysis kinds and before results are saved.
pub struct ScanOrchestrator {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    files: Arc<dyn FileStore>,
    adapters: Arc<dyn AdapterSource>,
    sink: Arc<dyn NotificationSink>,
}

impl ScanOrchestrator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        files: Arc<dyn FileStore>,
        adapters: Arc<dyn AdapterSource>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            store,
            files,
            adapters,
            sink,
        }
    }

    pub async fn create_scan(&self, profile_id: Option<i64>) -> Result<ScanRecord> {
        let scan = self.store.create_scan(profile_id).await?;
        tracing::info!("Created scan {}", scan.id);
        Ok(scan)
    }

    pub async fn recent_scans(&self, limit: usize) -> Result<Vec<ScanRecord>> {
        self.store.list_scans(limit).await
    }

    /// Marks a running scan failed. Returns false for scans in any other state.
    pub async fn cancel_scan(&self, scan_id: i64) -> Result<bool> {
        let mut scan = self.store.get_scan(scan_id).await?;
        if scan.status != ScanStatus::Running {
            return Ok(false);
        }
        scan.status = ScanStatus::Failed;
        scan.ended_at = Some(Utc::now());
        scan.diagnostic = Some("cancelled".to_string());
        self.store.update_scan(&scan).await?;
        self.sink.publish(scan_id, ScanEvent::Cancelled);
        tracing::info!("Cancelled scan {}", scan_id);
        Ok(true)
    }

    /// Runs a pending scan to completion and returns its final record.
    ///
    /// Scan-level failures (no provider, failed connection test, file listing
    /// errors) end in a `failed` record rather than an `Err`; `Err` is kept for
    /// store failures and for starting a scan that is not pending.
    pub async fn start(
        &self,
        scan_id: i64,
        file_subset: Option<Vec<String>>,
        kinds: &[AnalysisKind],
    ) -> Result<ScanRecord> {
        let mut scan = self.store.get_scan(scan_id).await?;
        if scan.status != ScanStatus::Pending {
            return Err(Error::InvalidTransition {
                from: scan.status.to_string(),
                to: ScanStatus::Running.to_string(),
            });
        }
        self.sink.publish(scan_id, ScanEvent::Started);

        let profile = match self.resolve_profile(scan.profile_id).await {
            Ok(profile) => profile,
            Err(reason) => return self.fail(scan, reason).await,
        };
        let adapter = match self.adapters.adapter_for(&profile) {
            Ok(adapter) => adapter,
            Err(err) => return self.fail(scan, err.to_string()).await,
        };
        tracing::info!(
            "Scan {} using profile '{}' ({} / {})",
            scan_id,
            profile.name,
            adapter.vendor(),
            adapter.model_name()
        );

        scan.profile_id = Some(profile.id);
        scan.status = ScanStatus::Running;
        self.store.update_scan(&scan).await?;

        let (connected, diagnostic) = adapter.test_connection().await;
        if !connected {
            return self
                .fail(scan, format!("Provider connection test failed: {}", diagnostic))
                .await;
        }

        let paths = match self.resolve_files(file_subset).await {
            Ok(paths) => paths,
            Err(err) => return self.fail(scan, err.to_string()).await,
        };
        scan.file_count = paths.len();
        self.store.update_scan(&scan).await?;
        self.sink.publish(scan_id, ScanEvent::Running { file_count: paths.len() });

        if paths.is_empty() {
            tracing::info!("Scan {} has no files to analyze", scan_id);
            return self.complete(scan, Vec::new(), Vec::new()).await;
        }

        let kinds = if kinds.is_empty() { DEFAULT_KINDS } else { kinds };
        let engine = SuggestionEngine::new(adapter.as_ref(), self.files.as_ref(), &self.config.chunking);
        let mut suggestions = Vec::new();
        let mut failures = Vec::new();

        for &kind in kinds {
            if let Some(cancelled) = self.cancelled(scan_id).await? {
                return Ok(cancelled);
            }
            self.sink.publish(scan_id, ScanEvent::KindStarted { kind });
            match engine.analyze(&paths, scan_id, kind).await {
                Ok(found) => {
                    self.sink.publish(
                        scan_id,
                        ScanEvent::KindFinished {
                            kind,
                            suggestions: found.len(),
                        },
                    );
                    suggestions.extend(found);
                }
                Err(err) => {
                    tracing::error!("{} analysis failed for scan {}: {}", kind, scan_id, err);
                    self.sink.publish(
                        scan_id,
                        ScanEvent::KindFailed {
                            kind,
                            reason: err.to_string(),
                        },
                    );
                    failures.push(format!("{} analysis failed: {}", kind, err));
                }
            }
        }

        if let Some(cancelled) = self.cancelled(scan_id).await? {
            return Ok(cancelled);
        }
        self.complete(scan, suggestions, failures).await
    }

    async fn resolve_profile(&self, profile_id: Option<i64>) -> std::result::Result<ProviderProfile, String> {
        match profile_id {
            Some(id) => self
                .store
                .get_profile(id)
                .await
                .map_err(|err| format!("Provider profile unavailable: {}", err)),
            None => match self.store.first_active_profile().await {
                Ok(Some(profile)) => Ok(profile),
                Ok(None) => Err("No active LLM provider profile configured".to_string()),
                Err(err) => Err(format!("Provider profile unavailable: {}", err)),
            },
        }
    }

    /// The files a scan analyzes: the explicit subset, or the file listing
    /// filtered by the stored include/exclude patterns (falling back to the
    /// configured ones).
    pub async fn resolve_files(&self, file_subset: Option<Vec<String>>) -> Result<Vec<String>> {
        if let Some(subset) = file_subset {
            return Ok(subset);
        }
        let includes = self
            .pattern_setting(INCLUDES_SETTING)
            .await?
            .unwrap_or_else(|| self.config.yaml_includes.clone());
        let excludes = self
            .pattern_setting(EXCLUDES_SETTING)
            .await?
            .unwrap_or_else(|| self.config.yaml_excludes.clone());

        let listing = self.files.list_files().await?;
        let paths = filter_paths(&listing, &includes, &excludes);
        tracing::info!("Found {} files to scan", paths.len());
        Ok(paths)
    }

    async fn pattern_setting(&self, key: &str) -> Result<Option<Vec<String>>> {
        let Some(raw) = self.store.get_setting(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(patterns) if !patterns.is_empty() => Ok(Some(patterns)),
            Ok(_) => Ok(None),
            Err(err) => {
                tracing::warn!("Ignoring malformed {} setting: {}", key, err);
                Ok(None)
            }
        }
    }

    /// The stored record if the scan was cancelled while running.
    async fn cancelled(&self, scan_id: i64) -> Result<Option<ScanRecord>> {
        let current = self.store.get_scan(scan_id).await?;
        if current.status == ScanStatus::Failed {
            tracing::info!("Scan {} was cancelled; stopping", scan_id);
            return Ok(Some(current));
        }
        Ok(None)
    }

    async fn complete(
        &self,
        mut scan: ScanRecord,
        suggestions: Vec<SuggestionRecord>,
        failures: Vec<String>,
    ) -> Result<ScanRecord> {
        for suggestion in suggestions {
            self.store.save_suggestion(suggestion).await?;
            scan.suggestion_count += 1;
        }
        scan.status = ScanStatus::Completed;
        scan.ended_at = Some(Utc::now());
        if !failures.is_empty() {
            scan.diagnostic = Some(failures.join("; "));
        }
        self.store.update_scan(&scan).await?;
        self.sink.publish(
            scan.id,
            ScanEvent::Completed {
                suggestions: scan.suggestion_count,
            },
        );
        tracing::info!(
            "Scan {} completed with {} suggestions",
            scan.id,
            scan.suggestion_count
        );
        Ok(scan)
    }

    async fn fail(&self, mut scan: ScanRecord, reason: String) -> Result<ScanRecord> {
        tracing::error!("Scan {} failed: {}", scan.id, reason);
        scan.status = ScanStatus::Failed;
        scan.ended_at = Some(Utc::now());
        scan.diagnostic = Some(reason.clone());
        self.store.update_scan(&scan).await?;
        self.sink.publish(scan.id, ScanEvent::Failed { reason });
        Ok(scan)
    }
}
