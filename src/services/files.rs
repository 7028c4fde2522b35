use crate::error::FilesystemError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::Pattern;
use ignore::WalkBuilder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

const ALLOWED_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "txt", "md"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Path relative to the configuration root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Read/write access to the configuration tree. Every path is relative to
/// the store's root and may not escape it.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn list_files(&self) -> Result<Vec<FileInfo>, FilesystemError>;

    async fn read(&self, path: &str) -> Result<String, FilesystemError>;

    /// Replaces the file, keeping the previous version as `<name>.bak`.
    async fn write(&self, path: &str, content: &str) -> Result<(), FilesystemError>;
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Paths matching any include pattern and no exclude pattern, in listing order.
/// Invalid patterns are ignored with a warning.
pub fn filter_paths(files: &[FileInfo], includes: &[String], excludes: &[String]) -> Vec<String> {
    let includes = compile(includes);
    let excludes = compile(excludes);
    files
        .iter()
        .filter(|f| includes.iter().any(|p| p.matches(&f.path)))
        .filter(|f| !excludes.iter().any(|p| p.matches(&f.path)))
        .map(|f| f.path.clone())
        .collect()
}

fn compile(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|raw| match Pattern::new(raw) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::warn!("Ignoring invalid file pattern '{}': {}", raw, err);
                None
            }
        })
        .collect()
}

/// Resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = normalize(&root.into());
        Self {
            root: if root.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                root
            },
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins `relative` onto the root and verifies the result stays inside it,
    /// both lexically and after following symlinks. For paths that do not
    /// exist yet, the deepest existing ancestor is checked instead.
    async fn resolve(&self, relative: &str) -> Result<PathBuf, FilesystemError> {
        let escapes = || {
            tracing::warn!("Rejected path outside the configuration root: {}", relative);
            FilesystemError::PathEscapesRoot(PathBuf::from(relative))
        };

        let base = normalize(&self.root);
        let joined = normalize(&self.root.join(relative));
        if joined == base || !joined.starts_with(&base) {
            return Err(escapes());
        }

        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|_| FilesystemError::NotFound(self.root.clone()))?;

        let mut existing = joined.clone();
        while tokio::fs::symlink_metadata(&existing).await.is_err() {
            if existing == self.root {
                return Err(FilesystemError::NotFound(self.root.clone()));
            }
            existing = match existing.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => self.root.clone(),
            };
        }
        // A dangling symlink fails to canonicalize and is rejected with the rest.
        match tokio::fs::canonicalize(&existing).await {
            Ok(real) if real.starts_with(&root) => Ok(joined),
            _ => Err(escapes()),
        }
    }

    fn walk(root: &Path) -> Vec<FileInfo> {
        let walker = WalkBuilder::new(root)
            .hidden(true)
            .ignore(true)
            .git_ignore(true)
            .git_exclude(true)
            .build();

        let mut files = Vec::new();
        for entry in walker.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let allowed = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
            if !allowed {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };

            files.push(FileInfo {
                path: relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn list_files(&self) -> Result<Vec<FileInfo>, FilesystemError> {
        if !self.root.is_dir() {
            return Err(FilesystemError::NotFound(self.root.clone()));
        }
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Self::walk(&root))
            .await
            .map_err(|err| FilesystemError::Unreadable {
                path: self.root.clone(),
                reason: err.to_string(),
            })
    }

    async fn read(&self, path: &str) -> Result<String, FilesystemError> {
        let full_path = self.resolve(path).await?;
        tokio::fs::read_to_string(&full_path)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => FilesystemError::NotFound(PathBuf::from(path)),
                _ => FilesystemError::Unreadable {
                    path: PathBuf::from(path),
                    reason: err.to_string(),
                },
            })
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), FilesystemError> {
        let full_path = self.resolve(path).await?;
        let write_failed = |reason: String| FilesystemError::WriteFailed {
            path: PathBuf::from(path),
            reason,
        };

        let mut backup_name = full_path.file_name().unwrap_or_default().to_os_string();
        backup_name.push(".bak");
        let backup = full_path.with_file_name(backup_name);

        let had_original = tokio::fs::try_exists(&full_path).await.unwrap_or(false);
        if had_original {
            tokio::fs::rename(&full_path, &backup)
                .await
                .map_err(|err| write_failed(format!("backup failed: {}", err)))?;
        }

        if let Err(err) = tokio::fs::write(&full_path, content).await {
            tracing::error!("Error writing {}: {}", path, err);
            if had_original {
                if let Err(restore) = tokio::fs::rename(&backup, &full_path).await {
                    tracing::error!("Could not restore backup of {}: {}", path, restore);
                }
            }
            return Err(write_failed(err.to_string()));
        }

        tracing::info!("Wrote {}", path);
        Ok(())
    }
}
