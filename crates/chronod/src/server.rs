//! MetaServer — wires the metadata control plane together.
//!
//! Owns the storage adapter, topology manager, member, and service for
//! one replica, and supervises the leader watcher. The RPC and HTTP
//! transports are mounted by the embedding deployment; this crate runs
//! everything beneath them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use chronogrid_kv::KvBackend;
use chronogrid_member::{ElectionContext, LeaderWatcher, LeadershipState, Member, MemberDescriptor};
use chronogrid_service::MetaService;
use chronogrid_storage::{keys, IdAllocator, MetaStorage};
use chronogrid_topology::TopologyManager;

use crate::bootstrap::{self, DEFAULT_CLUSTER_ID};
use crate::config::Config;

/// Election context of a standalone replica: with no peers, this node
/// is always the consensus leader.
struct StandaloneElection {
    self_id: u64,
    stopping: Arc<AtomicBool>,
}

impl ElectionContext for StandaloneElection {
    fn consensus_leader_id(&self) -> u64 {
        self.self_id
    }

    fn should_stop(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// One metadata replica, fully wired.
pub struct MetaServer {
    member: Arc<Member>,
    watcher: LeaderWatcher,
    service: Arc<MetaService>,
    topology: Arc<TopologyManager>,
    stopping: Arc<AtomicBool>,
}

impl MetaServer {
    /// Build a server over the given backend and bootstrap the default
    /// cluster. `cancel` aborts a bootstrap blocked on the backend.
    pub async fn new(
        config: &Config,
        kv: Arc<dyn KvBackend>,
        cancel: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let root = config.storage_root_path.as_str();
        let storage = MetaStorage::new(Arc::clone(&kv), root)
            .with_max_scan_limit(config.max_scan_limit);

        let cluster = bootstrap::ensure_default_cluster(&storage, config).await?;
        let topology = Arc::new(TopologyManager::new(storage.clone(), cluster.id));
        bootstrap::ensure_topology(&topology, &storage, cluster.shard_total, cancel).await?;

        let member = Arc::new(Member::new(
            MemberDescriptor {
                id: 1,
                name: config.node_name.clone(),
                endpoint: config.advertise_client_urls.clone(),
            },
            Arc::clone(&kv),
            root,
            config.etcd_call_timeout(),
            config.lease_sec,
        ));

        let stopping = Arc::new(AtomicBool::new(false));
        let watcher = LeaderWatcher::new(
            Arc::clone(&member),
            Arc::new(StandaloneElection {
                self_id: member.id(),
                stopping: Arc::clone(&stopping),
            }),
        );

        let schema_ids = IdAllocator::new(
            storage.kv(),
            keys::id_allocator_key(root, DEFAULT_CLUSTER_ID, "schema"),
            config.id_allocator_step,
        );
        let table_ids = IdAllocator::new(
            storage.kv(),
            keys::id_allocator_key(root, DEFAULT_CLUSTER_ID, "table"),
            config.id_allocator_step,
        );
        let service = Arc::new(MetaService::new(
            cluster.id,
            storage,
            Arc::clone(&topology),
            schema_ids,
            table_ids,
            member.leadership(),
        ));

        Ok(Self {
            member,
            watcher,
            service,
            topology,
            stopping,
        })
    }

    /// The service the transport layer mounts.
    pub fn meta_service(&self) -> Arc<MetaService> {
        Arc::clone(&self.service)
    }

    pub fn topology(&self) -> Arc<TopologyManager> {
        Arc::clone(&self.topology)
    }

    /// Subscribe to leadership changes.
    pub fn leadership(&self) -> watch::Receiver<LeadershipState> {
        self.member.leadership()
    }

    /// Run the election until `shutdown` trips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(member = %self.member.descriptor().name, "metadata server running");
        self.watcher.watch(shutdown).await;
        info!("metadata server stopped");
        Ok(())
    }

    /// Ask the election loop to stop at its next checkpoint.
    pub fn close(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}
