//! Error types for kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Resolution errors
    #[error("missing packages: {}", .0.join(", "))]
    MissingBinaries(Vec<String>),

    #[error("no binaries needed for this package")]
    NoBinariesNeeded,

    // Cache errors
    #[error("failed to lock cache at {path}: {source}")]
    CacheLock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to update cache ledger at {path}: {source}")]
    CacheLedger {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Transport errors
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("server returned {status} for {url}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    // Configuration errors
    #[error("invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Job errors
    #[error("invalid job file {path}: {reason}")]
    JobInvalid { path: PathBuf, reason: String },

    // Preinstall image errors
    #[error("preinstall image {file} unusable: {reason}")]
    ImageUnusable { file: String, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a transport error with context
    pub fn transport(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::CacheLock { .. } => {
                Some("Another worker may hold the cache lock; check for stale processes")
            }
            Self::Transport { .. } => Some("Check repository server connectivity"),
            _ => None,
        }
    }
}
