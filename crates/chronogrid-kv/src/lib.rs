//! KV backend contract for the ChronoGrid metadata service.
//!
//! The control plane persists everything through a replicated key-value
//! store that provides transactional compare-and-set, ranged reads,
//! leases, and watches. This crate defines that contract as an
//! object-safe trait plus the request/response vocabulary, and ships an
//! in-memory implementation (`MemKv`) used by tests and standalone mode.
//!
//! The production backend (an embedded consensus KV store) lives outside
//! this workspace and implements `KvBackend` behind its client.

pub mod cancel;
pub mod mem;
pub mod types;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use cancel::cancelled;
pub use mem::MemKv;
pub use types::{
    Compare, KeyValue, KvError, KvResult, LeaseGrant, LeaseId, TxnOp, TxnOpResponse, TxnRequest,
    TxnResponse, WatchEvent,
};

/// Transactional key-value backend with leases and watches.
///
/// All operations are atomic with respect to each other; `txn` is the
/// only multi-key atomic primitive. Implementations provide their own
/// durability and replication.
///
/// Callers cancel a blocking call by dropping its future (typically by
/// selecting it against [`cancel::cancelled`]); an abandoned mutation
/// either committed before the drop or not at all.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Atomic compare-and-set: if every `compare` holds, apply the
    /// `success` ops, otherwise the `failure` ops.
    async fn txn(&self, req: TxnRequest) -> KvResult<TxnResponse>;

    /// Point read. Returns the value and its modification revision.
    async fn get(&self, key: &str) -> KvResult<Option<KeyValue>>;

    /// Ranged read over `prefix` in lexicographic order, at most `limit`
    /// entries, starting after `from_key` when given (exclusive).
    async fn range(
        &self,
        prefix: &str,
        limit: usize,
        from_key: Option<&str>,
    ) -> KvResult<Vec<KeyValue>>;

    /// Unconditional write.
    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<()>;

    /// Write a key attached to a lease; the key is deleted when the
    /// lease expires or is revoked.
    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> KvResult<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> KvResult<bool>;

    /// Watch a single key for changes after `from_revision`. Events are
    /// delivered in revision order until the receiver is dropped.
    async fn watch(
        &self,
        key: &str,
        from_revision: u64,
    ) -> KvResult<mpsc::UnboundedReceiver<WatchEvent>>;

    /// Grant a lease with the given TTL in seconds.
    async fn lease_grant(&self, ttl_sec: i64) -> KvResult<LeaseGrant>;

    /// Renew a lease once. Returns the remaining TTL in seconds.
    async fn lease_keep_alive_once(&self, lease: LeaseId) -> KvResult<i64>;

    /// Revoke a lease, deleting every key attached to it.
    async fn lease_revoke(&self, lease: LeaseId) -> KvResult<()>;
}
