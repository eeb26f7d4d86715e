//! First-boot provisioning of the default cluster.
//!
//! Creates the cluster record, the empty cluster view, and one shard
//! view per shard when they do not exist yet. Safe to run on every
//! start; existing state is left untouched.

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use chronogrid_storage::{now_ms, Cluster, ClusterId, MetaStorage, StorageError};
use chronogrid_topology::{CreateShardView, TopologyManager};

use crate::config::Config;

/// The cluster provisioned at first boot.
pub const DEFAULT_CLUSTER_ID: ClusterId = 1;

/// Ensure the default cluster record exists.
pub async fn ensure_default_cluster(
    storage: &MetaStorage,
    config: &Config,
) -> anyhow::Result<Cluster> {
    match storage.get_cluster(DEFAULT_CLUSTER_ID).await {
        Ok(cluster) => Ok(cluster),
        Err(StorageError::NotFound(_)) => {
            let cluster = Cluster {
                id: DEFAULT_CLUSTER_ID,
                name: config.default_cluster_name.clone(),
                node_count: config.default_cluster_node_count,
                replication_factor: config.default_cluster_replication_factor,
                shard_total: config.default_cluster_shard_total,
                created_at_ms: now_ms(),
            };
            storage
                .create_cluster(&cluster)
                .await
                .context("create default cluster")?;
            info!(
                cluster = cluster.id,
                name = %cluster.name,
                shards = cluster.shard_total,
                "default cluster created"
            );
            Ok(cluster)
        }
        Err(err) => Err(err).context("read default cluster"),
    }
}

/// Load the topology and, on first boot, create the empty cluster view
/// plus a version-0 view per shard.
pub async fn ensure_topology(
    topology: &TopologyManager,
    storage: &MetaStorage,
    shard_total: u32,
    cancel: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    topology.load(cancel).await.context("load topology")?;

    match storage.get_cluster_view(DEFAULT_CLUSTER_ID).await {
        Ok(_) => Ok(()),
        Err(StorageError::NotFound(_)) => {
            topology
                .init_cluster_view(cancel)
                .await
                .context("init cluster view")?;
            topology
                .create_shard_views(
                    (1..=u64::from(shard_total))
                        .map(|shard_id| CreateShardView {
                            shard_id,
                            table_ids: Vec::new(),
                        })
                        .collect(),
                    cancel,
                )
                .await
                .context("create shard views")?;
            info!(shards = shard_total, "topology bootstrapped");
            Ok(())
        }
        Err(err) => Err(err).context("read cluster view"),
    }
}
