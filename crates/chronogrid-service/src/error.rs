//! Service-level error taxonomy.
//!
//! These are the stable error kinds transported to data-plane callers.
//! Errors from lower layers are converted preserving their kind;
//! `Internal` marks invariant violations that should never occur.

use thiserror::Error;

use chronogrid_member::MemberDescriptor;
use chronogrid_storage::{ShardId, StorageError};
use chronogrid_topology::TopologyError;

/// Result type alias for service operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Errors surfaced over the RPC boundary.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic version conflict; retry with a fresh snapshot.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no eligible shard on node {node}")]
    NoEligibleShard { node: String },

    /// This replica is not the leader; `hint` names the one to call.
    #[error("not the meta leader")]
    NotLeader { hint: Option<MemberDescriptor> },

    #[error("lease lost")]
    LeaseLost,

    #[error("lease grant failed: {0}")]
    LeaseGrantFailed(String),

    #[error("lease revoke failed: {0}")]
    LeaseRevokeFailed(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for MetaError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionMismatch { .. } => MetaError::Conflict(err.to_string()),
            StorageError::NotFound(what) => MetaError::ClusterNotFound(what),
            StorageError::AlreadyExists(what) => MetaError::AlreadyExists(what),
            StorageError::Backend { .. } => MetaError::BackendUnavailable(err.to_string()),
            StorageError::Serialize(_) | StorageError::Corrupt { .. } => {
                MetaError::Internal(err.to_string())
            }
        }
    }
}

impl From<TopologyError> for MetaError {
    fn from(err: TopologyError) -> Self {
        match err {
            TopologyError::ShardNotFound(id) => MetaError::ShardNotFound(id),
            TopologyError::TableNotFound(id) => MetaError::TableNotFound(format!("id {id}")),
            TopologyError::NoEligibleShard { node } => MetaError::NoEligibleShard { node },
            TopologyError::Conflict(what) => MetaError::Conflict(what),
            TopologyError::Cancelled => MetaError::Cancelled,
            TopologyError::Storage(inner) => inner.into(),
        }
    }
}
