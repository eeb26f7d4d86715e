//! Error types for topology operations.

use thiserror::Error;

use chronogrid_storage::{ShardId, StorageError, TableId};

/// Result type alias for topology operations.
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Errors that can occur during topology operations.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("table not found: {0}")]
    TableNotFound(TableId),

    /// Placement found no shard led by the node.
    #[error("no eligible shard on node {node}")]
    NoEligibleShard { node: String },

    /// Optimistic version check lost; retry with a fresh snapshot.
    #[error("topology version conflict: {0}")]
    Conflict(String),

    /// The caller gave up before the storage call completed.
    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for TopologyError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionMismatch { entity, expected } => {
                TopologyError::Conflict(format!("{entity} moved past {expected}"))
            }
            other => TopologyError::Storage(other),
        }
    }
}
