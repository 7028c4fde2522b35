use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("could not parse model output: {0}")]
    Parse(String),

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: i64 },

    #[error("cannot apply suggestion: {0}")]
    Apply(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }
}

/// Vendor-neutral failure classes for a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    RateLimit,
    Timeout,
    BadRequest,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::BadRequest => "bad_request",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{vendor} upstream error ({category}): {message}")]
pub struct UpstreamError {
    pub vendor: &'static str,
    pub category: ErrorCategory,
    pub message: String,
}

impl UpstreamError {
    pub fn new(vendor: &'static str, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            vendor,
            category,
            message: message.into(),
        }
    }

    /// Maps an HTTP status to the shared taxonomy.
    pub fn from_status(vendor: &'static str, status: u16, body: &str) -> Self {
        let category = match status {
            401 | 403 => ErrorCategory::Auth,
            429 => ErrorCategory::RateLimit,
            408 | 504 => ErrorCategory::Timeout,
            400..=499 => ErrorCategory::BadRequest,
            _ => ErrorCategory::Unknown,
        };
        let detail: String = body.chars().take(500).collect();
        Self::new(vendor, category, format!("HTTP {}: {}", status, detail))
    }

    pub fn from_transport(vendor: &'static str, err: &reqwest::Error) -> Self {
        let category = if err.is_timeout() {
            ErrorCategory::Timeout
        } else if let Some(status) = err.status() {
            return Self::from_status(vendor, status.as_u16(), &err.to_string());
        } else {
            ErrorCategory::Unknown
        };
        Self::new(vendor, category, err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FilesystemError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("cannot read {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("path escapes the configuration root: {}", .0.display())]
    PathEscapesRoot(PathBuf),

    #[error("cannot write {}: {reason}", path.display())]
    WriteFailed { path: PathBuf, reason: String },
}
