//! Error types for membership and election.

use thiserror::Error;

/// Result type alias for member operations.
pub type MemberResult<T> = Result<T, MemberError>;

/// Errors that can occur during election and lease handling.
#[derive(Debug, Error)]
pub enum MemberError {
    #[error("failed to grant lease: {0}")]
    LeaseGrantFailed(String),

    #[error("failed to revoke lease: {0}")]
    LeaseRevokeFailed(String),

    /// Another member created the leader key first.
    #[error("campaign lost: leader key already exists")]
    CampaignLost,

    /// A reset was attempted by a member that does not own the key.
    #[error("leader key is not owned by this member")]
    NotLeaderOwner,

    #[error("backend error: {context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: chronogrid_kv::KvError,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("watch stream closed")]
    WatchClosed,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl MemberError {
    pub fn backend(context: impl Into<String>, source: chronogrid_kv::KvError) -> Self {
        Self::Backend {
            context: context.into(),
            source,
        }
    }
}
