//! Shard action dispatch — the seam to data-plane nodes.

use async_trait::async_trait;

use chronogrid_storage::ShardId;

use crate::error::CoordinatorResult;

/// Delivers shard lifecycle actions to data-plane nodes.
///
/// The production implementation sends RPCs to the node's admin
/// endpoint; tests record the calls.
#[async_trait]
pub trait ShardDispatch: Send + Sync {
    /// Tell `node` to stop serving `shard_id`.
    async fn close_shard(&self, node: &str, shard_id: ShardId) -> CoordinatorResult<()>;

    /// Tell `node` to start serving `shard_id`.
    async fn open_shard(&self, node: &str, shard_id: ShardId) -> CoordinatorResult<()>;
}
