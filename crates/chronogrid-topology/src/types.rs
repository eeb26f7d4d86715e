//! Result and snapshot types exposed by the topology manager.

use std::collections::HashMap;

use chronogrid_storage::{ShardId, ShardNode, ShardView, TableId};

/// The tables of one shard as seen by a member node.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardTableIds {
    pub shard_node: ShardNode,
    pub table_ids: Vec<TableId>,
    pub version: u64,
}

/// Outcome of a shard-view mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardVersionUpdate {
    pub shard_id: ShardId,
    pub curr_version: u64,
    pub prev_version: u64,
}

/// Replica sets for a set of tables, with the implicated shard versions.
#[derive(Debug, Clone, Default)]
pub struct ShardNodesByTableIds {
    pub shard_nodes: HashMap<TableId, Vec<ShardNode>>,
    pub versions: HashMap<ShardId, u64>,
}

/// Every replica in the cluster plus current shard-view versions.
#[derive(Debug, Clone, Default)]
pub struct ShardNodesResult {
    pub shard_nodes: Vec<ShardNode>,
    pub versions: HashMap<ShardId, u64>,
}

/// Spec for one shard view created at cluster initialization.
#[derive(Debug, Clone)]
pub struct CreateShardView {
    pub shard_id: ShardId,
    pub table_ids: Vec<TableId>,
}

/// Immutable, by-value snapshot of the topology for placement policies.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    /// All replicas of the current cluster view.
    pub shard_nodes: Vec<ShardNode>,
    /// Current view of each shard.
    pub shard_views: HashMap<ShardId, ShardView>,
}
