//! Error types for the metadata store.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during metadata storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Optimistic version check failed; the caller holds a stale view.
    #[error("version mismatch on {entity}: expected latest {expected}")]
    VersionMismatch { entity: String, expected: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("backend error: {context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: chronogrid_kv::KvError,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StorageError {
    /// Wrap a backend error with a contextual message, preserving kind.
    pub fn backend(context: impl Into<String>, source: chronogrid_kv::KvError) -> Self {
        Self::Backend {
            context: context.into(),
            source,
        }
    }
}
