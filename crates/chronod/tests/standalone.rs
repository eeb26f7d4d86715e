//! End-to-end test of a standalone metadata server: bootstrap, leader
//! election, table allocation, routing, and clean shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use chronogrid_kv::{KvBackend, MemKv};
use chronogrid_service::NodeHeartbeatRequest;
use chronogrid_storage::{ClusterState, ShardNode, ShardRole};
use chronod::{Config, MetaServer};

/// A cancellation signal that never trips.
fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

async fn wait_for_leadership(server: &MetaServer) {
    let mut leadership = server.leadership();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if leadership.borrow().is_self {
                return;
            }
            leadership.changed().await.unwrap();
        }
    })
    .await
    .expect("server never became leader");
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.node_name = "meta-test".to_string();
    config.default_cluster_shard_total = 4;
    config
}

#[tokio::test]
async fn standalone_server_serves_metadata() {
    let config = test_config();
    let kv: Arc<dyn KvBackend> = Arc::new(MemKv::new());
    let server = Arc::new(
        MetaServer::new(&config, kv, &mut no_cancel())
            .await
            .unwrap(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(shutdown_rx).await })
    };
    wait_for_leadership(&server).await;

    // Place the four bootstrap shards on a data node.
    let topology = server.topology();
    topology
        .update_cluster_view(
            ClusterState::Stable,
            (1..=4)
                .map(|shard_id| ShardNode {
                    shard_id,
                    node_name: "dn1".to_string(),
                    role: ShardRole::Leader,
                })
                .collect(),
            &mut no_cancel(),
        )
        .await
        .unwrap();

    let service = server.meta_service();
    let leader = service.leader_handle().unwrap();

    // Heartbeat registers the node and reports its shards.
    let heartbeat = service
        .node_heartbeat(
            &leader,
            NodeHeartbeatRequest {
                node_name: "dn1".to_string(),
            },
            &mut no_cancel(),
        )
        .await
        .unwrap();
    assert_eq!(heartbeat.assigned_shards.len(), 4);

    // Allocate a schema and a table, then route to it.
    service
        .alloc_schema_id(&leader, "metrics", &mut no_cancel())
        .await
        .unwrap();
    let placement = service
        .alloc_table_id(&leader, "metrics", "cpu", "dn1", &mut no_cancel())
        .await
        .unwrap();
    assert!((1..=4).contains(&placement.shard_id));

    let routed = service
        .route_tables("metrics", &["cpu".to_string()], &mut no_cancel())
        .await
        .unwrap();
    assert_eq!(routed.entries["cpu"].table.id, placement.table.id);
    assert_eq!(routed.entries["cpu"].node_shards[0].node_name, "dn1");

    // The placed table shows up in the shard listing for its node.
    let tables = service
        .get_tables_of_shards("dn1", &[1, 2, 3, 4], &mut no_cancel())
        .await
        .unwrap();
    let total: usize = tables.values().map(|t| t.table_ids.len()).sum();
    assert_eq!(total, 1);

    // Clean shutdown: the election loop exits and leadership is vacated.
    server.close();
    shutdown_tx.send(true).unwrap();
    run_handle.await.unwrap().unwrap();
    assert!(!server.leadership().borrow().is_self);
}

#[tokio::test]
async fn restart_preserves_metadata() {
    let config = test_config();
    let kv: Arc<dyn KvBackend> = Arc::new(MemKv::new());

    {
        let server = Arc::new(
            MetaServer::new(&config, Arc::clone(&kv), &mut no_cancel())
                .await
                .unwrap(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_handle = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run(shutdown_rx).await })
        };
        wait_for_leadership(&server).await;

        server
            .topology()
            .update_cluster_view(
                ClusterState::Stable,
                vec![ShardNode {
                    shard_id: 1,
                    node_name: "dn1".to_string(),
                    role: ShardRole::Leader,
                }],
                &mut no_cancel(),
            )
            .await
            .unwrap();
        let service = server.meta_service();
        let leader = service.leader_handle().unwrap();
        service
            .alloc_schema_id(&leader, "metrics", &mut no_cancel())
            .await
            .unwrap();
        service
            .alloc_table_id(&leader, "metrics", "cpu", "dn1", &mut no_cancel())
            .await
            .unwrap();

        server.close();
        shutdown_tx.send(true).unwrap();
        run_handle.await.unwrap().unwrap();
    }

    // A second server over the same backend loads the same state.
    let server = Arc::new(
        MetaServer::new(&config, kv, &mut no_cancel())
            .await
            .unwrap(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(shutdown_rx).await })
    };
    wait_for_leadership(&server).await;

    let routed = server
        .meta_service()
        .route_tables("metrics", &["cpu".to_string()], &mut no_cancel())
        .await
        .unwrap();
    assert_eq!(routed.entries.len(), 1);

    server.close();
    shutdown_tx.send(true).unwrap();
    run_handle.await.unwrap().unwrap();
}
