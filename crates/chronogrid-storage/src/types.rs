//! Persisted entities of the metadata store.
//!
//! All entities are serialized to JSON for storage under the key-path
//! schema in `keys`. IDs are plain `u64` aliases; names are UTF-8 and
//! must not contain `/` (keys are built by concatenation).

use serde::{Deserialize, Serialize};

/// Unique identifier for a cluster.
pub type ClusterId = u64;

/// Unique identifier for a schema within a cluster.
pub type SchemaId = u64;

/// Unique identifier for a table within a cluster.
pub type TableId = u64;

/// Unique identifier for a shard within a cluster.
pub type ShardId = u64;

// ── Cluster ───────────────────────────────────────────────────────

/// A named collection of nodes and shards. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub node_count: u32,
    pub replication_factor: u32,
    pub shard_total: u32,
    /// Unix timestamp (milliseconds) when the cluster was created.
    pub created_at_ms: u64,
}

// ── Node ──────────────────────────────────────────────────────────

/// Liveness state of a data-plane node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Online,
    Offline,
}

/// A data-plane server process, keyed by `(cluster_id, name)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub name: String,
    /// Unix timestamp (milliseconds) of the last heartbeat.
    pub last_touch_ms: u64,
    pub state: NodeState,
}

// ── Schema & Table ────────────────────────────────────────────────

/// A schema (database) within a cluster. `name` unique per cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    pub id: SchemaId,
    pub name: String,
}

/// Opaque partitioning payload carried with a table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartitionInfo {
    /// Partition key column names; empty for unpartitioned tables.
    pub partition_keys: Vec<String>,
}

/// A table. `(schema_id, name)` unique; `id` unique within the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub schema_id: SchemaId,
    pub id: TableId,
    pub name: String,
    pub partition_info: PartitionInfo,
}

// ── Topology ──────────────────────────────────────────────────────

/// Lifecycle state of a cluster view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    /// Created, no shards placed yet.
    Empty,
    /// All shards placed, not yet serving.
    Prepare,
    /// Serving.
    Stable,
}

/// Replica role of a shard on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRole {
    Leader,
    Follower,
}

/// One shard replica placed on a node. Role `Leader` is exclusive per
/// shard within a given cluster view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardNode {
    pub shard_id: ShardId,
    pub node_name: String,
    pub role: ShardRole,
}

/// Versioned record of which table IDs currently live on a shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardView {
    pub shard_id: ShardId,
    /// Optimistic-concurrency cursor; strictly increasing per shard.
    pub version: u64,
    pub table_ids: Vec<TableId>,
    pub created_at_ms: u64,
}

/// Versioned record of the shard→node assignment and cluster state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterView {
    pub cluster_id: ClusterId,
    /// Strictly increasing per cluster.
    pub version: u64,
    pub state: ClusterState,
    pub shard_nodes: Vec<ShardNode>,
    pub created_at_ms: u64,
}

/// Unix timestamp in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
