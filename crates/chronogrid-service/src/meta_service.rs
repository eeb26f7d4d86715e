//! MetaService — the operations data-plane nodes call.
//!
//! Thin handlers over the topology manager, storage, and ID allocators.
//! Every mutating operation takes a `LeaderHandle`: the handle is the
//! capability, minted only while this replica is the published leader.
//! There is no ambient "am I leader" check inside the mutation paths.
//!
//! Every operation also takes a cancellation signal; tripping it
//! abandons the in-flight storage call and answers `Cancelled`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use chronogrid_member::LeadershipState;
use chronogrid_storage::{
    now_ms, ClusterId, IdAllocator, MetaStorage, Node, NodeState, PartitionInfo, Schema, SchemaId,
    ShardId, ShardNode, Table, TableId,
};
use chronogrid_topology::{ShardTableIds, TopologyError, TopologyManager};

use crate::error::{MetaError, MetaResult};

/// Capability to mutate cluster metadata. Minted by
/// [`MetaService::leader_handle`] only while this replica leads.
#[derive(Debug)]
pub struct LeaderHandle(());

/// Run one blocking call, abandoning it with `Cancelled` if the signal
/// trips first.
async fn cancellable<T, E>(
    cancel: &mut watch::Receiver<bool>,
    call: impl Future<Output = Result<T, E>>,
) -> MetaResult<T>
where
    MetaError: From<E>,
{
    if *cancel.borrow() {
        return Err(MetaError::Cancelled);
    }
    tokio::select! {
        result = call => result.map_err(MetaError::from),
        _ = chronogrid_kv::cancelled(cancel) => Err(MetaError::Cancelled),
    }
}

/// Table identity returned to routing callers.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub schema_id: SchemaId,
    pub schema_name: String,
}

/// Outcome of a table allocation: the table and where it lives.
#[derive(Debug, Clone)]
pub struct TablePlacement {
    pub table: Table,
    pub shard_id: ShardId,
    pub shard_version: u64,
}

/// Per-shard table listing, with the shard-view version.
pub type ShardTables = ShardTableIds;

/// Heartbeat payload from a data-plane node.
#[derive(Debug, Clone)]
pub struct NodeHeartbeatRequest {
    pub node_name: String,
}

/// Heartbeat answer: the topology frontier and this node's shards.
#[derive(Debug, Clone)]
pub struct NodeHeartbeatResponse {
    pub cluster_view_version: u64,
    pub assigned_shards: Vec<ShardNode>,
}

/// One routed table.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub table: TableInfo,
    pub node_shards: Vec<ShardNode>,
}

/// Answer to a route-tables request. Unknown table names are omitted.
#[derive(Debug, Clone)]
pub struct RouteTablesResponse {
    pub cluster_view_version: u64,
    pub entries: HashMap<String, RouteEntry>,
}

/// The metadata service of one cluster.
pub struct MetaService {
    cluster_id: ClusterId,
    storage: MetaStorage,
    topology: Arc<TopologyManager>,
    schema_ids: IdAllocator,
    table_ids: IdAllocator,
    leadership: watch::Receiver<LeadershipState>,
}

impl MetaService {
    pub fn new(
        cluster_id: ClusterId,
        storage: MetaStorage,
        topology: Arc<TopologyManager>,
        schema_ids: IdAllocator,
        table_ids: IdAllocator,
        leadership: watch::Receiver<LeadershipState>,
    ) -> Self {
        Self {
            cluster_id,
            storage,
            topology,
            schema_ids,
            table_ids,
            leadership,
        }
    }

    /// Mint the mutation capability, or refuse with a hint to the
    /// current leader.
    pub fn leader_handle(&self) -> MetaResult<LeaderHandle> {
        let state = self.leadership.borrow();
        if state.is_self {
            Ok(LeaderHandle(()))
        } else {
            Err(MetaError::NotLeader {
                hint: state.leader.clone(),
            })
        }
    }

    // ── Schema allocation ──────────────────────────────────────────

    /// Resolve a schema by name, creating it when absent.
    pub async fn alloc_schema_id(
        &self,
        _leader: &LeaderHandle,
        schema_name: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> MetaResult<SchemaId> {
        validate_name(schema_name)?;
        if let Some(schema) = self.find_schema(schema_name, cancel).await? {
            return Ok(schema.id);
        }

        let id = cancellable(cancel, self.schema_ids.alloc()).await?;
        let schema = Schema {
            id,
            name: schema_name.to_string(),
        };
        match cancellable(cancel, self.storage.create_schema(self.cluster_id, &schema)).await {
            Ok(()) => {
                info!(cluster = self.cluster_id, schema = id, name = %schema_name, "schema allocated");
                Ok(id)
            }
            // Lost a race to another allocation of the same name.
            Err(MetaError::AlreadyExists(_)) => self
                .find_schema(schema_name, cancel)
                .await?
                .map(|s| s.id)
                .ok_or_else(|| MetaError::SchemaNotFound(schema_name.to_string())),
            Err(err) => Err(err),
        }
    }

    async fn find_schema(
        &self,
        schema_name: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> MetaResult<Option<Schema>> {
        let schemas = cancellable(cancel, self.storage.list_schemas(self.cluster_id)).await?;
        Ok(schemas.into_iter().find(|s| s.name == schema_name))
    }

    // ── Table allocation ───────────────────────────────────────────

    /// Allocate a table: assign an ID, persist the record, and place it
    /// on a shard led by `node_name`. Allocating an existing name
    /// returns the existing table and its current placement.
    pub async fn alloc_table_id(
        &self,
        _leader: &LeaderHandle,
        schema_name: &str,
        table_name: &str,
        node_name: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> MetaResult<TablePlacement> {
        validate_name(table_name)?;
        let schema = self
            .find_schema(schema_name, cancel)
            .await?
            .ok_or_else(|| MetaError::SchemaNotFound(schema_name.to_string()))?;

        if let Some(existing) = cancellable(
            cancel,
            self.storage
                .get_table_by_name(self.cluster_id, schema.id, table_name),
        )
        .await?
        {
            return self.placement_of(existing, node_name, cancel).await;
        }

        let id = cancellable(cancel, self.table_ids.alloc()).await?;
        let table = Table {
            schema_id: schema.id,
            id,
            name: table_name.to_string(),
            partition_info: PartitionInfo::default(),
        };
        cancellable(cancel, self.storage.create_table(self.cluster_id, &table)).await?;

        let update = match self.topology.add_table(node_name, &table, cancel).await {
            Ok(update) => update,
            // A cancelled placement leaves the record; the next
            // allocation of this name re-places it.
            Err(TopologyError::Cancelled) => return Err(MetaError::Cancelled),
            Err(err) => {
                // Placement failed; drop the orphaned record so the
                // name can be retried.
                let _ = self
                    .storage
                    .delete_table(self.cluster_id, schema.id, table_name)
                    .await;
                return Err(err.into());
            }
        };

        info!(
            cluster = self.cluster_id,
            table = id,
            name = %table_name,
            shard = update.shard_id,
            "table allocated"
        );
        Ok(TablePlacement {
            table,
            shard_id: update.shard_id,
            shard_version: update.curr_version,
        })
    }

    /// Current placement of an existing table; re-places it when the
    /// record exists but no shard carries it (interrupted allocation).
    async fn placement_of(
        &self,
        table: Table,
        node_name: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> MetaResult<TablePlacement> {
        match self.topology.get_shard_nodes_by_table_ids(&[table.id]).await {
            Ok(routed) => {
                let shard_id = routed.shard_nodes[&table.id]
                    .first()
                    .map(|sn| sn.shard_id)
                    .ok_or_else(|| MetaError::Internal(format!("table {} unrouted", table.id)))?;
                let shard_version = routed.versions.get(&shard_id).copied().unwrap_or(0);
                Ok(TablePlacement {
                    table,
                    shard_id,
                    shard_version,
                })
            }
            Err(TopologyError::TableNotFound(_)) => {
                let update = self.topology.add_table(node_name, &table, cancel).await?;
                Ok(TablePlacement {
                    table,
                    shard_id: update.shard_id,
                    shard_version: update.curr_version,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a table from its shard and delete its record.
    pub async fn drop_table(
        &self,
        _leader: &LeaderHandle,
        schema_name: &str,
        table_name: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> MetaResult<()> {
        let schema = self
            .find_schema(schema_name, cancel)
            .await?
            .ok_or_else(|| MetaError::SchemaNotFound(schema_name.to_string()))?;
        let table = cancellable(
            cancel,
            self.storage
                .get_table_by_name(self.cluster_id, schema.id, table_name),
        )
        .await?
        .ok_or_else(|| MetaError::TableNotFound(table_name.to_string()))?;

        match self.topology.remove_table(table.id, cancel).await {
            Ok(_) | Err(TopologyError::TableNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        cancellable(
            cancel,
            self.storage
                .delete_table(self.cluster_id, schema.id, table_name),
        )
        .await?;
        info!(cluster = self.cluster_id, table = table.id, name = %table_name, "table dropped");
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// The tables of each requested shard where `node_name` hosts a
    /// replica.
    pub async fn get_tables_of_shards(
        &self,
        node_name: &str,
        shard_ids: &[ShardId],
        cancel: &mut watch::Receiver<bool>,
    ) -> MetaResult<HashMap<ShardId, ShardTables>> {
        if *cancel.borrow() {
            return Err(MetaError::Cancelled);
        }
        Ok(self.topology.get_table_ids(shard_ids, node_name).await)
    }

    /// Routing entries for the named tables. Unknown names are omitted.
    pub async fn route_tables(
        &self,
        schema_name: &str,
        table_names: &[String],
        cancel: &mut watch::Receiver<bool>,
    ) -> MetaResult<RouteTablesResponse> {
        let schema = self
            .find_schema(schema_name, cancel)
            .await?
            .ok_or_else(|| MetaError::SchemaNotFound(schema_name.to_string()))?;

        let mut entries = HashMap::new();
        for table_name in table_names {
            let Some(table) = cancellable(
                cancel,
                self.storage
                    .get_table_by_name(self.cluster_id, schema.id, table_name),
            )
            .await?
            else {
                continue;
            };
            let node_shards = match self.topology.get_shard_nodes_by_table_ids(&[table.id]).await {
                Ok(routed) => routed.shard_nodes[&table.id].clone(),
                // Known but unplaced: not routable yet.
                Err(TopologyError::TableNotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            entries.insert(
                table_name.clone(),
                RouteEntry {
                    table: TableInfo {
                        id: table.id,
                        name: table.name,
                        schema_id: schema.id,
                        schema_name: schema_name.to_string(),
                    },
                    node_shards,
                },
            );
        }
        Ok(RouteTablesResponse {
            cluster_view_version: self.topology.get_version().await,
            entries,
        })
    }

    // ── Heartbeat ──────────────────────────────────────────────────

    /// Record a node heartbeat and answer with the topology frontier
    /// and the node's shard assignments.
    pub async fn node_heartbeat(
        &self,
        _leader: &LeaderHandle,
        req: NodeHeartbeatRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> MetaResult<NodeHeartbeatResponse> {
        validate_name(&req.node_name)?;
        self.topology
            .put_node(
                Node {
                    name: req.node_name.clone(),
                    last_touch_ms: now_ms(),
                    state: NodeState::Online,
                },
                cancel,
            )
            .await?;
        debug!(cluster = self.cluster_id, node = %req.node_name, "heartbeat");

        let all = self.topology.get_shard_nodes().await;
        let assigned_shards = all
            .shard_nodes
            .into_iter()
            .filter(|sn| sn.node_name == req.node_name)
            .collect();
        Ok(NodeHeartbeatResponse {
            cluster_view_version: self.topology.get_version().await,
            assigned_shards,
        })
    }
}

/// Names become key-path segments, so they must be non-empty and free
/// of `/`.
fn validate_name(name: &str) -> MetaResult<()> {
    if name.is_empty() {
        return Err(MetaError::InvalidArgument("empty name".to_string()));
    }
    if name.contains('/') {
        return Err(MetaError::InvalidArgument(format!(
            "name {name:?} contains '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronogrid_kv::MemKv;
    use chronogrid_member::MemberDescriptor;
    use chronogrid_storage::{keys, ClusterState, ShardRole};
    use chronogrid_topology::CreateShardView;
    use std::time::Duration;

    struct Harness {
        kv: Arc<MemKv>,
        service: Arc<MetaService>,
        topology: Arc<TopologyManager>,
        leadership_tx: watch::Sender<LeadershipState>,
    }

    /// A cancellation signal that never trips.
    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    async fn harness(leader_shards: &[(ShardId, &str)]) -> Harness {
        let kv = Arc::new(MemKv::new());
        let storage =
            MetaStorage::new(Arc::clone(&kv) as Arc<dyn chronogrid_kv::KvBackend>, "/meta");
        let topology = Arc::new(TopologyManager::new(storage.clone(), 1).with_rng_seed(7));
        topology.load(&mut no_cancel()).await.unwrap();
        topology.init_cluster_view(&mut no_cancel()).await.unwrap();
        topology
            .create_shard_views(
                leader_shards
                    .iter()
                    .map(|&(shard_id, _)| CreateShardView {
                        shard_id,
                        table_ids: Vec::new(),
                    })
                    .collect(),
                &mut no_cancel(),
            )
            .await
            .unwrap();
        topology
            .update_cluster_view(
                ClusterState::Stable,
                leader_shards
                    .iter()
                    .map(|&(shard_id, node)| ShardNode {
                        shard_id,
                        node_name: node.to_string(),
                        role: ShardRole::Leader,
                    })
                    .collect(),
                &mut no_cancel(),
            )
            .await
            .unwrap();

        let (leadership_tx, leadership_rx) = watch::channel(LeadershipState {
            leader: Some(self_descriptor()),
            is_self: true,
        });
        let schema_ids =
            IdAllocator::new(storage.kv(), keys::id_allocator_key("/meta", 1, "schema"), 20);
        let table_ids =
            IdAllocator::new(storage.kv(), keys::id_allocator_key("/meta", 1, "table"), 20);
        Harness {
            kv,
            service: Arc::new(MetaService::new(
                1,
                storage,
                Arc::clone(&topology),
                schema_ids,
                table_ids,
                leadership_rx,
            )),
            topology,
            leadership_tx,
        }
    }

    fn self_descriptor() -> MemberDescriptor {
        MemberDescriptor {
            id: 1,
            name: "meta-1".to_string(),
            endpoint: "http://meta-1:2379".to_string(),
        }
    }

    fn other_descriptor() -> MemberDescriptor {
        MemberDescriptor {
            id: 2,
            name: "meta-2".to_string(),
            endpoint: "http://meta-2:2379".to_string(),
        }
    }

    // ── Leader capability ──────────────────────────────────────────

    #[tokio::test]
    async fn followers_get_not_leader_with_hint() {
        let h = harness(&[(1, "n1")]).await;
        h.leadership_tx
            .send(LeadershipState {
                leader: Some(other_descriptor()),
                is_self: false,
            })
            .unwrap();

        match h.service.leader_handle() {
            Err(MetaError::NotLeader { hint }) => {
                assert_eq!(hint.unwrap().name, "meta-2");
            }
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leader_mints_the_handle() {
        let h = harness(&[(1, "n1")]).await;
        assert!(h.service.leader_handle().is_ok());
    }

    // ── Schema allocation ──────────────────────────────────────────

    #[tokio::test]
    async fn alloc_schema_id_is_idempotent() {
        let h = harness(&[(1, "n1")]).await;
        let leader = h.service.leader_handle().unwrap();

        let first = h
            .service
            .alloc_schema_id(&leader, "metrics", &mut no_cancel())
            .await
            .unwrap();
        let second = h
            .service
            .alloc_schema_id(&leader, "metrics", &mut no_cancel())
            .await
            .unwrap();
        assert_eq!(first, second);

        let other = h
            .service
            .alloc_schema_id(&leader, "logs", &mut no_cancel())
            .await
            .unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn names_with_slashes_rejected() {
        let h = harness(&[(1, "n1")]).await;
        let leader = h.service.leader_handle().unwrap();

        assert!(matches!(
            h.service
                .alloc_schema_id(&leader, "a/b", &mut no_cancel())
                .await,
            Err(MetaError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.service
                .alloc_table_id(&leader, "metrics", "", "n1", &mut no_cancel())
                .await,
            Err(MetaError::InvalidArgument(_))
        ));
    }

    // ── Table allocation ───────────────────────────────────────────

    #[tokio::test]
    async fn alloc_table_places_and_persists() {
        let h = harness(&[(1, "n1"), (3, "n1")]).await;
        let leader = h.service.leader_handle().unwrap();
        h.service
            .alloc_schema_id(&leader, "metrics", &mut no_cancel())
            .await
            .unwrap();

        let placement = h
            .service
            .alloc_table_id(&leader, "metrics", "cpu", "n1", &mut no_cancel())
            .await
            .unwrap();
        assert!(placement.shard_id == 1 || placement.shard_id == 3);
        assert_eq!(placement.shard_version, 1);

        // Same name again: same table, same shard.
        let again = h
            .service
            .alloc_table_id(&leader, "metrics", "cpu", "n1", &mut no_cancel())
            .await
            .unwrap();
        assert_eq!(again.table.id, placement.table.id);
        assert_eq!(again.shard_id, placement.shard_id);
    }

    #[tokio::test]
    async fn alloc_table_requires_schema() {
        let h = harness(&[(1, "n1")]).await;
        let leader = h.service.leader_handle().unwrap();

        assert!(matches!(
            h.service
                .alloc_table_id(&leader, "nope", "cpu", "n1", &mut no_cancel())
                .await,
            Err(MetaError::SchemaNotFound(_))
        ));
    }

    #[tokio::test]
    async fn alloc_table_without_led_shard_leaves_no_record() {
        let h = harness(&[(1, "n1")]).await;
        let leader = h.service.leader_handle().unwrap();
        h.service
            .alloc_schema_id(&leader, "metrics", &mut no_cancel())
            .await
            .unwrap();

        // n2 leads nothing.
        assert!(matches!(
            h.service
                .alloc_table_id(&leader, "metrics", "cpu", "n2", &mut no_cancel())
                .await,
            Err(MetaError::NoEligibleShard { .. })
        ));

        // The name is retryable on an eligible node.
        let placement = h
            .service
            .alloc_table_id(&leader, "metrics", "cpu", "n1", &mut no_cancel())
            .await
            .unwrap();
        assert_eq!(placement.shard_id, 1);
    }

    #[tokio::test]
    async fn drop_table_removes_record_and_placement() {
        let h = harness(&[(1, "n1")]).await;
        let leader = h.service.leader_handle().unwrap();
        h.service
            .alloc_schema_id(&leader, "metrics", &mut no_cancel())
            .await
            .unwrap();
        h.service
            .alloc_table_id(&leader, "metrics", "cpu", "n1", &mut no_cancel())
            .await
            .unwrap();

        h.service
            .drop_table(&leader, "metrics", "cpu", &mut no_cancel())
            .await
            .unwrap();

        assert!(matches!(
            h.service
                .drop_table(&leader, "metrics", "cpu", &mut no_cancel())
                .await,
            Err(MetaError::TableNotFound(_))
        ));
        let routed = h
            .service
            .route_tables("metrics", &["cpu".to_string()], &mut no_cancel())
            .await
            .unwrap();
        assert!(routed.entries.is_empty());
    }

    // ── Reads ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn get_tables_of_shards_scoped_to_member_node() {
        let h = harness(&[(1, "n1"), (2, "n2")]).await;
        let leader = h.service.leader_handle().unwrap();
        h.service
            .alloc_schema_id(&leader, "metrics", &mut no_cancel())
            .await
            .unwrap();
        let placement = h
            .service
            .alloc_table_id(&leader, "metrics", "cpu", "n1", &mut no_cancel())
            .await
            .unwrap();

        let tables = h
            .service
            .get_tables_of_shards("n1", &[1, 2], &mut no_cancel())
            .await
            .unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[&1].table_ids, vec![placement.table.id]);
        assert_eq!(tables[&1].version, 1);
    }

    #[tokio::test]
    async fn route_tables_skips_unknown_names() {
        let h = harness(&[(1, "n1")]).await;
        let leader = h.service.leader_handle().unwrap();
        h.service
            .alloc_schema_id(&leader, "metrics", &mut no_cancel())
            .await
            .unwrap();
        h.service
            .alloc_table_id(&leader, "metrics", "cpu", "n1", &mut no_cancel())
            .await
            .unwrap();

        let routed = h
            .service
            .route_tables(
                "metrics",
                &["cpu".to_string(), "ghost".to_string()],
                &mut no_cancel(),
            )
            .await
            .unwrap();
        assert_eq!(routed.entries.len(), 1);
        let entry = &routed.entries["cpu"];
        assert_eq!(entry.table.schema_name, "metrics");
        assert_eq!(entry.node_shards[0].node_name, "n1");
    }

    // ── Heartbeat ──────────────────────────────────────────────────

    #[tokio::test]
    async fn heartbeat_registers_node_and_lists_assignments() {
        let h = harness(&[(1, "n1"), (2, "n1"), (3, "n2")]).await;
        let leader = h.service.leader_handle().unwrap();

        let resp = h
            .service
            .node_heartbeat(
                &leader,
                NodeHeartbeatRequest {
                    node_name: "n1".to_string(),
                },
                &mut no_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(resp.cluster_view_version, h.topology.get_version().await);
        let mut shards: Vec<ShardId> =
            resp.assigned_shards.iter().map(|sn| sn.shard_id).collect();
        shards.sort_unstable();
        assert_eq!(shards, vec![1, 2]);
        assert!(h.topology.get_node("n1").await.is_some());
    }

    // ── Cancellation ───────────────────────────────────────────────

    #[tokio::test]
    async fn pre_cancelled_rpc_is_refused() {
        let h = harness(&[(1, "n1")]).await;
        let leader = h.service.leader_handle().unwrap();

        let (cancel_tx, mut cancel) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        assert!(matches!(
            h.service
                .alloc_schema_id(&leader, "metrics", &mut cancel)
                .await,
            Err(MetaError::Cancelled)
        ));
        assert!(matches!(
            h.service.get_tables_of_shards("n1", &[1], &mut cancel).await,
            Err(MetaError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn cancel_abandons_a_stalled_backend_call() {
        let h = harness(&[(1, "n1")]).await;

        h.kv.set_stalled(true);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let call = tokio::spawn({
            let service = Arc::clone(&h.service);
            async move {
                let leader = service.leader_handle().unwrap();
                let mut cancel = cancel_rx;
                service.alloc_schema_id(&leader, "metrics", &mut cancel).await
            }
        });

        cancel_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("cancelled rpc did not return")
            .unwrap();
        assert!(matches!(result, Err(MetaError::Cancelled)));

        // The abandoned call persisted nothing; the allocation works
        // once the backend is back.
        h.kv.set_stalled(false);
        let leader = h.service.leader_handle().unwrap();
        h.service
            .alloc_schema_id(&leader, "metrics", &mut no_cancel())
            .await
            .unwrap();
    }
}
