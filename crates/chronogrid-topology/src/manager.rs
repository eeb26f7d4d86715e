//! TopologyManager — the authoritative in-memory topology of one cluster.
//!
//! A single reader-writer lock protects the cluster view and every
//! derived index. Readers take a shared lock and receive value copies.
//! Writers hold the exclusive lock across the whole logical operation:
//! compute the next value, persist it with the expected version, then
//! mutate memory — or leave memory untouched and surface the error.
//!
//! Every storage-backed method takes a cancellation signal; when it
//! trips, the in-flight storage call is abandoned, `Cancelled` is
//! returned, and memory is left untouched.

use std::collections::HashMap;
use std::future::Future;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use chronogrid_storage::{
    now_ms, ClusterId, ClusterState, ClusterView, MetaStorage, Node, ShardId, ShardNode,
    ShardRole, ShardView, StorageError, Table, TableId,
};

use crate::error::{TopologyError, TopologyResult};
use crate::types::*;

/// Run one storage call, abandoning it with `Cancelled` if the signal
/// trips first.
async fn cancellable<T>(
    cancel: &mut watch::Receiver<bool>,
    call: impl Future<Output = Result<T, StorageError>>,
) -> TopologyResult<T> {
    if *cancel.borrow() {
        return Err(TopologyError::Cancelled);
    }
    tokio::select! {
        result = call => result.map_err(Into::into),
        _ = chronogrid_kv::cancelled(cancel) => Err(TopologyError::Cancelled),
    }
}

#[derive(Default)]
struct Inner {
    cluster_view: Option<ClusterView>,
    /// shard_id → replicas of the shard.
    shard_nodes_by_shard: HashMap<ShardId, Vec<ShardNode>>,
    /// node name → replicas hosted on the node.
    node_shards_by_node: HashMap<String, Vec<ShardNode>>,
    /// shard_id → current shard view.
    shard_views_by_shard: HashMap<ShardId, ShardView>,
    /// table_id → owning shard.
    shard_by_table: HashMap<TableId, ShardId>,
    /// node name → node record.
    nodes_by_name: HashMap<String, Node>,
}

/// Manages the topology of a single cluster.
pub struct TopologyManager {
    storage: MetaStorage,
    cluster_id: ClusterId,
    state: RwLock<Inner>,
    rng: RwLock<StdRng>,
}

impl TopologyManager {
    pub fn new(storage: MetaStorage, cluster_id: ClusterId) -> Self {
        Self {
            storage,
            cluster_id,
            state: RwLock::new(Inner::default()),
            rng: RwLock::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic placement randomness, for tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = RwLock::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// Refresh the whole in-memory topology from storage: cluster view,
    /// then the views of every referenced shard, then nodes. A cluster
    /// that has no view yet loads as empty.
    pub async fn load(&self, cancel: &mut watch::Receiver<bool>) -> TopologyResult<()> {
        let mut inner = self.state.write().await;

        match cancellable(cancel, self.storage.get_cluster_view(self.cluster_id)).await {
            Ok(view) => rebuild_cluster_view(&mut inner, view),
            Err(TopologyError::Storage(StorageError::NotFound(_))) => {
                *inner = Inner::default();
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        self.reload_shard_views(&mut inner, cancel).await?;

        let nodes = cancellable(cancel, self.storage.list_nodes(self.cluster_id)).await?;
        inner.nodes_by_name = nodes.into_iter().map(|n| (n.name.clone(), n)).collect();

        info!(
            cluster = self.cluster_id,
            shards = inner.shard_views_by_shard.len(),
            nodes = inner.nodes_by_name.len(),
            "topology loaded"
        );
        Ok(())
    }

    /// Current cluster view version (0 when not yet initialized).
    pub async fn get_version(&self) -> u64 {
        let inner = self.state.read().await;
        inner.cluster_view.as_ref().map_or(0, |v| v.version)
    }

    /// Current cluster lifecycle state.
    pub async fn get_cluster_state(&self) -> ClusterState {
        let inner = self.state.read().await;
        inner
            .cluster_view
            .as_ref()
            .map_or(ClusterState::Empty, |v| v.state)
    }

    /// The tables of each requested shard, restricted to shards where
    /// `node_name` hosts a replica. Shards where the node is absent are
    /// omitted silently.
    pub async fn get_table_ids(
        &self,
        shard_ids: &[ShardId],
        node_name: &str,
    ) -> HashMap<ShardId, ShardTableIds> {
        let inner = self.state.read().await;
        let mut result = HashMap::with_capacity(shard_ids.len());
        for &shard_id in shard_ids {
            let Some(replicas) = inner.shard_nodes_by_shard.get(&shard_id) else {
                continue;
            };
            let Some(shard_node) = replicas.iter().find(|sn| sn.node_name == node_name) else {
                continue;
            };
            let Some(view) = inner.shard_views_by_shard.get(&shard_id) else {
                continue;
            };
            result.insert(
                shard_id,
                ShardTableIds {
                    shard_node: shard_node.clone(),
                    table_ids: view.table_ids.clone(),
                    version: view.version,
                },
            );
        }
        result
    }

    /// Place a table on a uniformly random shard led by `node_name` and
    /// commit the new shard view. The previous table set is preserved.
    pub async fn add_table(
        &self,
        node_name: &str,
        table: &Table,
        cancel: &mut watch::Receiver<bool>,
    ) -> TopologyResult<ShardVersionUpdate> {
        let mut inner = self.state.write().await;

        let leader_shards: Vec<ShardId> = inner
            .node_shards_by_node
            .get(node_name)
            .map(|replicas| {
                replicas
                    .iter()
                    .filter(|sn| sn.role == ShardRole::Leader)
                    .map(|sn| sn.shard_id)
                    .collect()
            })
            .unwrap_or_default();
        if leader_shards.is_empty() {
            return Err(TopologyError::NoEligibleShard {
                node: node_name.to_string(),
            });
        }

        let shard_id = {
            let mut rng = self.rng.write().await;
            leader_shards[rng.gen_range(0..leader_shards.len())]
        };
        let view = inner
            .shard_views_by_shard
            .get(&shard_id)
            .ok_or(TopologyError::ShardNotFound(shard_id))?;
        let prev_version = view.version;

        let mut table_ids = view.table_ids.clone();
        if !table_ids.contains(&table.id) {
            table_ids.push(table.id);
        }
        let new_view = ShardView {
            shard_id,
            version: prev_version + 1,
            table_ids,
            created_at_ms: now_ms(),
        };

        cancellable(
            cancel,
            self.storage
                .update_shard_view(self.cluster_id, &new_view, prev_version),
        )
        .await?;

        inner.shard_views_by_shard.insert(shard_id, new_view);
        inner.shard_by_table.insert(table.id, shard_id);

        debug!(
            cluster = self.cluster_id,
            shard = shard_id,
            table = table.id,
            version = prev_version + 1,
            "table placed"
        );
        Ok(ShardVersionUpdate {
            shard_id,
            curr_version: prev_version + 1,
            prev_version,
        })
    }

    /// Remove a table from its owning shard and commit the new view.
    pub async fn remove_table(
        &self,
        table_id: TableId,
        cancel: &mut watch::Receiver<bool>,
    ) -> TopologyResult<ShardVersionUpdate> {
        let mut inner = self.state.write().await;

        let shard_id = *inner
            .shard_by_table
            .get(&table_id)
            .ok_or(TopologyError::TableNotFound(table_id))?;
        let view = inner
            .shard_views_by_shard
            .get(&shard_id)
            .ok_or(TopologyError::ShardNotFound(shard_id))?;
        let prev_version = view.version;

        let table_ids: Vec<TableId> = view
            .table_ids
            .iter()
            .copied()
            .filter(|&id| id != table_id)
            .collect();
        let new_view = ShardView {
            shard_id,
            version: prev_version + 1,
            table_ids,
            created_at_ms: now_ms(),
        };

        cancellable(
            cancel,
            self.storage
                .update_shard_view(self.cluster_id, &new_view, prev_version),
        )
        .await?;

        inner.shard_views_by_shard.insert(shard_id, new_view);
        inner.shard_by_table.remove(&table_id);

        debug!(
            cluster = self.cluster_id,
            shard = shard_id,
            table = table_id,
            version = prev_version + 1,
            "table removed"
        );
        Ok(ShardVersionUpdate {
            shard_id,
            curr_version: prev_version + 1,
            prev_version,
        })
    }

    /// All replicas of one shard.
    pub async fn get_shard_nodes_by_id(&self, shard_id: ShardId) -> TopologyResult<Vec<ShardNode>> {
        let inner = self.state.read().await;
        inner
            .shard_nodes_by_shard
            .get(&shard_id)
            .cloned()
            .ok_or(TopologyError::ShardNotFound(shard_id))
    }

    /// Replica sets for each listed table, with shard-view versions.
    pub async fn get_shard_nodes_by_table_ids(
        &self,
        table_ids: &[TableId],
    ) -> TopologyResult<ShardNodesByTableIds> {
        let inner = self.state.read().await;
        let mut result = ShardNodesByTableIds::default();
        for &table_id in table_ids {
            let shard_id = *inner
                .shard_by_table
                .get(&table_id)
                .ok_or(TopologyError::TableNotFound(table_id))?;
            let replicas = inner
                .shard_nodes_by_shard
                .get(&shard_id)
                .ok_or(TopologyError::ShardNotFound(shard_id))?;
            result.shard_nodes.insert(table_id, replicas.clone());
            if let Some(view) = inner.shard_views_by_shard.get(&shard_id) {
                result.versions.entry(shard_id).or_insert(view.version);
            }
        }
        Ok(result)
    }

    /// Every replica in the cluster plus shard-view versions.
    pub async fn get_shard_nodes(&self) -> ShardNodesResult {
        let inner = self.state.read().await;
        let mut result = ShardNodesResult::default();
        for replicas in inner.shard_nodes_by_shard.values() {
            result.shard_nodes.extend(replicas.iter().cloned());
        }
        for (&shard_id, view) in &inner.shard_views_by_shard {
            result.versions.insert(shard_id, view.version);
        }
        result
    }

    /// A node record, when known.
    pub async fn get_node(&self, node_name: &str) -> Option<Node> {
        let inner = self.state.read().await;
        inner.nodes_by_name.get(node_name).cloned()
    }

    /// Register or refresh a node record (write-through).
    pub async fn put_node(
        &self,
        node: Node,
        cancel: &mut watch::Receiver<bool>,
    ) -> TopologyResult<()> {
        let mut inner = self.state.write().await;
        cancellable(cancel, self.storage.put_node(self.cluster_id, &node)).await?;
        inner.nodes_by_name.insert(node.name.clone(), node);
        Ok(())
    }

    /// Create the empty cluster view (version 0, state `Empty`).
    pub async fn init_cluster_view(&self, cancel: &mut watch::Receiver<bool>) -> TopologyResult<()> {
        let mut inner = self.state.write().await;
        let view = ClusterView {
            cluster_id: self.cluster_id,
            version: 0,
            state: ClusterState::Empty,
            shard_nodes: Vec::new(),
            created_at_ms: now_ms(),
        };
        cancellable(cancel, self.storage.create_cluster_view(&view)).await?;
        rebuild_cluster_view(&mut inner, view);
        info!(cluster = self.cluster_id, "cluster view initialized");
        Ok(())
    }

    /// Commit a new cluster view with `state` and `shard_nodes` against
    /// the version currently in memory, then rebuild every index from
    /// storage.
    pub async fn update_cluster_view(
        &self,
        state: ClusterState,
        shard_nodes: Vec<ShardNode>,
        cancel: &mut watch::Receiver<bool>,
    ) -> TopologyResult<()> {
        let mut inner = self.state.write().await;
        let current_version = inner.cluster_view.as_ref().map_or(0, |v| v.version);

        let new_view = ClusterView {
            cluster_id: self.cluster_id,
            version: current_version + 1,
            state,
            shard_nodes,
            created_at_ms: now_ms(),
        };
        cancellable(
            cancel,
            self.storage.update_cluster_view(&new_view, current_version),
        )
        .await?;

        // Rebuild from what storage now holds.
        let view = cancellable(cancel, self.storage.get_cluster_view(self.cluster_id)).await?;
        rebuild_cluster_view(&mut inner, view);
        self.reload_shard_views(&mut inner, cancel).await?;
        info!(
            cluster = self.cluster_id,
            version = current_version + 1,
            ?state,
            "cluster view updated"
        );
        Ok(())
    }

    /// Create the initial view (version 0) for each listed shard.
    pub async fn create_shard_views(
        &self,
        specs: Vec<CreateShardView>,
        cancel: &mut watch::Receiver<bool>,
    ) -> TopologyResult<()> {
        let mut inner = self.state.write().await;

        let views: Vec<ShardView> = specs
            .into_iter()
            .map(|spec| ShardView {
                shard_id: spec.shard_id,
                version: 0,
                table_ids: spec.table_ids,
                created_at_ms: now_ms(),
            })
            .collect();
        cancellable(
            cancel,
            self.storage.create_shard_views(self.cluster_id, &views),
        )
        .await?;

        for view in views {
            for &table_id in &view.table_ids {
                inner.shard_by_table.insert(table_id, view.shard_id);
            }
            inner.shard_views_by_shard.insert(view.shard_id, view);
        }
        Ok(())
    }

    /// Immutable snapshot for placement policies.
    pub async fn snapshot(&self) -> TopologySnapshot {
        let inner = self.state.read().await;
        let mut shard_nodes = Vec::new();
        for replicas in inner.shard_nodes_by_shard.values() {
            shard_nodes.extend(replicas.iter().cloned());
        }
        TopologySnapshot {
            shard_nodes,
            shard_views: inner.shard_views_by_shard.clone(),
        }
    }

    /// Reload the views of every shard referenced by the cluster view,
    /// rebuilding the table→shard index.
    async fn reload_shard_views(
        &self,
        inner: &mut Inner,
        cancel: &mut watch::Receiver<bool>,
    ) -> TopologyResult<()> {
        let shard_ids: Vec<ShardId> = inner.shard_nodes_by_shard.keys().copied().collect();
        let views = cancellable(
            cancel,
            self.storage.list_shard_views(self.cluster_id, &shard_ids),
        )
        .await?;

        inner.shard_views_by_shard = HashMap::with_capacity(views.len());
        inner.shard_by_table = HashMap::new();
        for view in views {
            for &table_id in &view.table_ids {
                inner.shard_by_table.insert(table_id, view.shard_id);
            }
            inner.shard_views_by_shard.insert(view.shard_id, view);
        }
        Ok(())
    }
}

/// Install a cluster view and rebuild the per-shard / per-node indexes.
fn rebuild_cluster_view(inner: &mut Inner, view: ClusterView) {
    inner.shard_nodes_by_shard = HashMap::new();
    inner.node_shards_by_node = HashMap::new();
    for shard_node in &view.shard_nodes {
        inner
            .shard_nodes_by_shard
            .entry(shard_node.shard_id)
            .or_default()
            .push(shard_node.clone());
        inner
            .node_shards_by_node
            .entry(shard_node.node_name.clone())
            .or_default()
            .push(shard_node.clone());
    }
    inner.cluster_view = Some(view);
}
