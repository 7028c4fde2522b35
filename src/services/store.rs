use crate::adapters::llm::ProviderProfile;
use crate::core::scan::{ScanRecord, ScanStatus};
use crate::core::suggestion::{SuggestionRecord, SuggestionStatus};
use crate::error::{Error, FilesystemError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Record storage for scans, suggestions, provider profiles and settings.
///
/// Ids are assigned by the store. Listings are newest first. Updates are
/// independent writes with no concurrency guard.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_scan(&self, profile_id: Option<i64>) -> Result<ScanRecord>;
    async fn get_scan(&self, id: i64) -> Result<ScanRecord>;
    async fn update_scan(&self, scan: &ScanRecord) -> Result<()>;
    async fn list_scans(&self, limit: usize) -> Result<Vec<ScanRecord>>;

    async fn save_suggestion(&self, record: SuggestionRecord) -> Result<SuggestionRecord>;
    /// Suggestions of one scan, in the order they were saved.
    async fn load_suggestions(&self, scan_id: i64) -> Result<Vec<SuggestionRecord>>;
    async fn get_suggestion(&self, id: i64) -> Result<SuggestionRecord>;
    async fn update_suggestion(&self, record: &SuggestionRecord) -> Result<()>;
    /// Moves a suggestion along its status machine.
    async fn update_status(&self, id: i64, status: SuggestionStatus) -> Result<SuggestionRecord>;
    async fn list_suggestions(&self) -> Result<Vec<SuggestionRecord>>;

    /// Inserts a profile, or replaces the one with the same id or name.
    async fn upsert_profile(&self, profile: ProviderProfile) -> Result<ProviderProfile>;
    async fn get_profile(&self, id: i64) -> Result<ProviderProfile>;
    async fn first_active_profile(&self) -> Result<Option<ProviderProfile>>;
    async fn list_profiles(&self) -> Result<Vec<ProviderProfile>>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    next_id: i64,
    scans: BTreeMap<i64, ScanRecord>,
    suggestions: BTreeMap<i64, SuggestionRecord>,
    profiles: BTreeMap<i64, ProviderProfile>,
    settings: BTreeMap<String, String>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory tables, optionally snapshotted to a JSON file after every change.
pub struct JsonStore {
    tables: Mutex<Tables>,
    snapshot: Option<PathBuf>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Loads `path` if it exists; later changes are written back to it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| FilesystemError::Unreadable {
                path: path.clone(),
                reason: err.to_string(),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(err) => {
                return Err(FilesystemError::Unreadable {
                    path,
                    reason: err.to_string(),
                }
                .into())
            }
        };
        Ok(Self {
            tables: Mutex::new(tables),
            snapshot: Some(path),
        })
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let write_failed = |reason: String| FilesystemError::WriteFailed {
            path: path.clone(),
            reason,
        };

        let json = serde_json::to_string_pretty(tables).map_err(|e| write_failed(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_failed(e.to_string()))?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| write_failed(e.to_string()))?;
        tokio::fs::rename(&staging, path)
            .await
            .map_err(|e| write_failed(e.to_string()))?;
        Ok(())
    }
}

fn newest_first<T: Clone>(rows: &BTreeMap<i64, T>) -> Vec<T> {
    rows.values().rev().cloned().collect()
}

#[async_trait]
impl Store for JsonStore {
    async fn create_scan(&self, profile_id: Option<i64>) -> Result<ScanRecord> {
        let mut tables = self.tables.lock().await;
        let scan = ScanRecord {
            id: tables.allocate_id(),
            status: ScanStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            file_count: 0,
            profile_id,
            suggestion_count: 0,
            diagnostic: None,
        };
        tables.scans.insert(scan.id, scan.clone());
        self.persist(&tables).await?;
        Ok(scan)
    }

    async fn get_scan(&self, id: i64) -> Result<ScanRecord> {
        let tables = self.tables.lock().await;
        tables
            .scans
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound { what: "scan", id })
    }

    async fn update_scan(&self, scan: &ScanRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let Some(slot) = tables.scans.get_mut(&scan.id) else {
            return Err(Error::NotFound {
                what: "scan",
                id: scan.id,
            });
        };
        *slot = scan.clone();
        self.persist(&tables).await
    }

    async fn list_scans(&self, limit: usize) -> Result<Vec<ScanRecord>> {
        let tables = self.tables.lock().await;
        let mut scans = newest_first(&tables.scans);
        scans.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        scans.truncate(limit);
        Ok(scans)
    }

    async fn save_suggestion(&self, mut record: SuggestionRecord) -> Result<SuggestionRecord> {
        let mut tables = self.tables.lock().await;
        record.id = tables.allocate_id();
        tables.suggestions.insert(record.id, record.clone());
        self.persist(&tables).await?;
        Ok(record)
    }

    async fn load_suggestions(&self, scan_id: i64) -> Result<Vec<SuggestionRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .suggestions
            .values()
            .filter(|s| s.scan_id == scan_id)
            .cloned()
            .collect())
    }

    async fn get_suggestion(&self, id: i64) -> Result<SuggestionRecord> {
        let tables = self.tables.lock().await;
        tables
            .suggestions
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound {
                what: "suggestion",
                id,
            })
    }

    async fn update_suggestion(&self, record: &SuggestionRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let Some(slot) = tables.suggestions.get_mut(&record.id) else {
            return Err(Error::NotFound {
                what: "suggestion",
                id: record.id,
            });
        };
        *slot = record.clone();
        self.persist(&tables).await
    }

    async fn update_status(&self, id: i64, status: SuggestionStatus) -> Result<SuggestionRecord> {
        let mut tables = self.tables.lock().await;
        let record = tables.suggestions.get_mut(&id).ok_or(Error::NotFound {
            what: "suggestion",
            id,
        })?;
        record.transition(status)?;
        let updated = record.clone();
        self.persist(&tables).await?;
        Ok(updated)
    }

    async fn list_suggestions(&self) -> Result<Vec<SuggestionRecord>> {
        let tables = self.tables.lock().await;
        let mut suggestions = newest_first(&tables.suggestions);
        suggestions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(suggestions)
    }

    async fn upsert_profile(&self, mut profile: ProviderProfile) -> Result<ProviderProfile> {
        let mut tables = self.tables.lock().await;
        let existing = if tables.profiles.contains_key(&profile.id) {
            Some(profile.id)
        } else {
            tables
                .profiles
                .values()
                .find(|p| p.name == profile.name)
                .map(|p| p.id)
        };
        profile.id = match existing {
            Some(id) => id,
            None => tables.allocate_id(),
        };
        tables.profiles.insert(profile.id, profile.clone());
        self.persist(&tables).await?;
        Ok(profile)
    }

    async fn get_profile(&self, id: i64) -> Result<ProviderProfile> {
        let tables = self.tables.lock().await;
        tables
            .profiles
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound { what: "profile", id })
    }

    async fn first_active_profile(&self) -> Result<Option<ProviderProfile>> {
        let tables = self.tables.lock().await;
        Ok(tables.profiles.values().find(|p| p.is_active).cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<ProviderProfile>> {
        let tables = self.tables.lock().await;
        Ok(newest_first(&tables.profiles))
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let tables = self.tables.lock().await;
        Ok(tables.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.settings.insert(key.to_string(), value.to_string());
        self.persist(&tables).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::ParsedSuggestion;
    use crate::core::suggestion::{Impact, SuggestionDetails};

    fn profile(name: &str, active: bool) -> ProviderProfile {
        ProviderProfile {
            id: 0,
            name: name.to_string(),
            vendor: "openai".to_string(),
            model_name: Some("gpt-4o-mini".to_string()),
            endpoint: None,
            api_key: None,
            context_tokens: None,
            is_active: active,
        }
    }

    fn suggestion(scan_id: i64, title: &str) -> SuggestionRecord {
        SuggestionRecord::from_parsed(
            scan_id,
            ParsedSuggestion {
                title: title.to_string(),
                description: String::new(),
                impact: Impact::Low,
                category: None,
                details: SuggestionDetails::Optimization {
                    file_path: None,
                    before: None,
                    after: None,
                    reasoning: None,
                },
                defaulted: vec!["category"],
            },
        )
    }

    #[tokio::test]
    async fn scans_get_ids_and_list_newest_first() {
        let store = JsonStore::in_memory();
        let first = store.create_scan(None).await.unwrap();
        let second = store.create_scan(Some(4)).await.unwrap();

        assert_eq!(first.status, ScanStatus::Pending);
        assert_ne!(first.id, second.id);
        let listed: Vec<i64> = store.list_scans(10).await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![second.id, first.id]);
        assert_eq!(store.list_scans(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let store = JsonStore::in_memory();
        assert!(matches!(
            store.get_scan(99).await,
            Err(Error::NotFound { what: "scan", id: 99 })
        ));
        assert!(matches!(
            store.update_status(5, SuggestionStatus::Accepted).await,
            Err(Error::NotFound { what: "suggestion", .. })
        ));
    }

    #[tokio::test]
    async fn suggestions_load_per_scan_in_save_order() {
        let store = JsonStore::in_memory();
        store.save_suggestion(suggestion(1, "a")).await.unwrap();
        store.save_suggestion(suggestion(2, "other")).await.unwrap();
        store.save_suggestion(suggestion(1, "b")).await.unwrap();

        let titles: Vec<String> = store
            .load_suggestions(1)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.title)
            .collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn status_updates_follow_the_state_machine() {
        let store = JsonStore::in_memory();
        let saved = store.save_suggestion(suggestion(1, "a")).await.unwrap();

        let accepted = store
            .update_status(saved.id, SuggestionStatus::Accepted)
            .await
            .unwrap();
        assert_eq!(accepted.status, SuggestionStatus::Accepted);
        assert!(matches!(
            store.update_status(saved.id, SuggestionStatus::Rejected).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(
            store.get_suggestion(saved.id).await.unwrap().status,
            SuggestionStatus::Accepted
        );
    }

    #[tokio::test]
    async fn profiles_upsert_by_name_and_pick_first_active() {
        let store = JsonStore::in_memory();
        assert!(store.first_active_profile().await.unwrap().is_none());

        let idle = store.upsert_profile(profile("idle", false)).await.unwrap();
        let main = store.upsert_profile(profile("main", true)).await.unwrap();
        let mut renamed = profile("main", true);
        renamed.model_name = Some("gpt-4o".to_string());
        let replaced = store.upsert_profile(renamed).await.unwrap();

        assert_eq!(replaced.id, main.id);
        assert_ne!(idle.id, main.id);
        assert_eq!(store.list_profiles().await.unwrap().len(), 2);
        let active = store.first_active_profile().await.unwrap().unwrap();
        assert_eq!(active.model_name.as_deref(), Some("gpt-4o"));
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state").join("store.json");

        let store = JsonStore::open(&path).await.unwrap();
        let scan = store.create_scan(None).await.unwrap();
        store.save_suggestion(suggestion(scan.id, "kept")).await.unwrap();
        store.put_setting("theme", "dark").await.unwrap();
        drop(store);

        let reopened = JsonStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_scan(scan.id).await.unwrap().id, scan.id);
        assert_eq!(reopened.load_suggestions(scan.id).await.unwrap()[0].title, "kept");
        assert_eq!(
            reopened.get_setting("theme").await.unwrap().as_deref(),
            Some("dark")
        );
        let next = reopened.create_scan(None).await.unwrap();
        assert!(next.id > scan.id);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_unreadable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            JsonStore::open(&path).await,
            Err(Error::Filesystem(FilesystemError::Unreadable { .. }))
        ));
    }
}
