//! Key-path schema for persisted entities.
//!
//! All keys live under a configurable root in the `v1` namespace.
//! Numeric IDs are zero-padded to 20 decimal digits so lexicographic
//! order equals numeric order for range scans. Names that may contain
//! `/` are rejected at the service boundary, so plain concatenation is
//! safe.
//!
//! ```text
//! <root>/v1/cluster/info/<ID>                                -> Cluster
//! <root>/v1/cluster/<ID>/topo/latest_version                 -> u64
//! <root>/v1/cluster/<ID>/topo/<version>                      -> ClusterView
//! <root>/v1/cluster/<ID>/shard/<ID>/latest_version           -> u64
//! <root>/v1/cluster/<ID>/shard/<ID>/<version>                -> ShardView
//! <root>/v1/cluster/<ID>/node/<name>                         -> Node
//! <root>/v1/cluster/<ID>/schema/info/<ID>                    -> Schema
//! <root>/v1/cluster/<ID>/schema/<ID>/table/<ID>              -> Table
//! <root>/v1/cluster/<ID>/schema/<ID>/table_name_to_id/<name> -> u64
//! ```

use crate::types::{ClusterId, SchemaId, ShardId, TableId};

const VERSION: &str = "v1";
const LATEST_VERSION: &str = "latest_version";

/// Format an ID as a 20-digit zero-padded decimal.
pub fn fmt_id(id: u64) -> String {
    format!("{id:020}")
}

/// Key of a cluster info record.
pub fn cluster_key(root: &str, cluster_id: ClusterId) -> String {
    format!("{root}/{VERSION}/cluster/info/{}", fmt_id(cluster_id))
}

/// Prefix under which all cluster info records live.
pub fn cluster_prefix(root: &str) -> String {
    format!("{root}/{VERSION}/cluster/info/")
}

/// Key of the cluster view's latest-version counter.
pub fn cluster_view_latest_version_key(root: &str, cluster_id: ClusterId) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/topo/{LATEST_VERSION}",
        fmt_id(cluster_id)
    )
}

/// Key of a versioned cluster view blob.
pub fn cluster_view_key(root: &str, cluster_id: ClusterId, version: u64) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/topo/{}",
        fmt_id(cluster_id),
        fmt_id(version)
    )
}

/// Key of a shard view's latest-version counter.
pub fn shard_view_latest_version_key(root: &str, cluster_id: ClusterId, shard_id: ShardId) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/shard/{}/{LATEST_VERSION}",
        fmt_id(cluster_id),
        fmt_id(shard_id)
    )
}

/// Key of a versioned shard view blob.
pub fn shard_view_key(root: &str, cluster_id: ClusterId, shard_id: ShardId, version: u64) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/shard/{}/{}",
        fmt_id(cluster_id),
        fmt_id(shard_id),
        fmt_id(version)
    )
}

/// Key of a node record.
pub fn node_key(root: &str, cluster_id: ClusterId, node_name: &str) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/node/{node_name}",
        fmt_id(cluster_id)
    )
}

/// Prefix under which a cluster's node records live.
pub fn node_prefix(root: &str, cluster_id: ClusterId) -> String {
    format!("{root}/{VERSION}/cluster/{}/node/", fmt_id(cluster_id))
}

/// Key of a schema info record.
pub fn schema_key(root: &str, cluster_id: ClusterId, schema_id: SchemaId) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/schema/info/{}",
        fmt_id(cluster_id),
        fmt_id(schema_id)
    )
}

/// Prefix under which a cluster's schema info records live.
pub fn schema_prefix(root: &str, cluster_id: ClusterId) -> String {
    format!("{root}/{VERSION}/cluster/{}/schema/info/", fmt_id(cluster_id))
}

/// Key of a table record.
pub fn table_key(root: &str, cluster_id: ClusterId, schema_id: SchemaId, table_id: TableId) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/schema/{}/table/{}",
        fmt_id(cluster_id),
        fmt_id(schema_id),
        fmt_id(table_id)
    )
}

/// Prefix under which a schema's table records live.
pub fn table_prefix(root: &str, cluster_id: ClusterId, schema_id: SchemaId) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/schema/{}/table/",
        fmt_id(cluster_id),
        fmt_id(schema_id)
    )
}

/// Key of a table name→ID mapping.
pub fn table_name_to_id_key(
    root: &str,
    cluster_id: ClusterId,
    schema_id: SchemaId,
    table_name: &str,
) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/schema/{}/table_name_to_id/{table_name}",
        fmt_id(cluster_id),
        fmt_id(schema_id)
    )
}

/// Key of an ID allocator's high-water mark.
pub fn id_allocator_key(root: &str, cluster_id: ClusterId, name: &str) -> String {
    format!(
        "{root}/{VERSION}/cluster/{}/id/{name}/{LATEST_VERSION}",
        fmt_id(cluster_id)
    )
}

/// Key under which the elected meta-leader descriptor is stored.
pub fn leader_key(root: &str) -> String {
    format!("{root}/{VERSION}/leader")
}
