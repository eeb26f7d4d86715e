//! Request/response vocabulary for the KV backend contract.

use thiserror::Error;

/// Lease identifier handed out by `lease_grant`.
pub type LeaseId = i64;

/// Result type alias for KV backend operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors surfaced by a KV backend.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("transaction error: {0}")]
    Txn(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// A key with its value and the revision of its last modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: u64,
}

/// A predicate evaluated atomically inside `txn`.
#[derive(Debug, Clone)]
pub enum Compare {
    /// The key exists and its value equals `value` byte-for-byte.
    ValueEquals { key: String, value: Vec<u8> },
    /// The key does not exist.
    KeyMissing { key: String },
}

/// An operation applied inside `txn`.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    PutWithLease { key: String, value: Vec<u8>, lease: LeaseId },
    Delete { key: String },
    Get { key: String },
}

/// An atomic compare-and-set request.
#[derive(Debug, Clone, Default)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl TxnRequest {
    /// Txn that applies `success` only when every compare holds, and
    /// does nothing otherwise.
    pub fn when(compare: Vec<Compare>, success: Vec<TxnOp>) -> Self {
        Self {
            compare,
            success,
            failure: Vec::new(),
        }
    }
}

/// Per-op result inside a `TxnResponse`, in request order.
#[derive(Debug, Clone)]
pub enum TxnOpResponse {
    Put,
    Delete { existed: bool },
    Get { kv: Option<KeyValue> },
}

/// Outcome of a `txn` call.
#[derive(Debug, Clone)]
pub struct TxnResponse {
    /// Whether the compare predicates held (and `success` ran).
    pub succeeded: bool,
    pub responses: Vec<TxnOpResponse>,
}

/// Lease grant result.
#[derive(Debug, Clone, Copy)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl_sec: i64,
}

/// A change observed by a watcher.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put { kv: KeyValue },
    Delete { key: String, revision: u64 },
}

impl WatchEvent {
    /// The revision at which this event was committed.
    pub fn revision(&self) -> u64 {
        match self {
            WatchEvent::Put { kv } => kv.mod_revision,
            WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}
