//! MetaStorage — typed transactional adapter over the KV backend.
//!
//! Every mutation is a single KV transaction; reads are point-in-time.
//! Versioned entities (cluster view, shard views) pair a
//! `latest_version` counter with versioned blobs and are updated with
//! optimistic compare-and-set: the transaction commits only when the
//! stored counter equals the version the caller read.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use chronogrid_kv::{Compare, KeyValue, KvBackend, TxnOp, TxnRequest};

use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::types::*;

const DEFAULT_MAX_SCAN_LIMIT: usize = 100;

/// Typed metadata storage over a shared KV backend.
#[derive(Clone)]
pub struct MetaStorage {
    kv: Arc<dyn KvBackend>,
    root: String,
    max_scan_limit: usize,
}

impl MetaStorage {
    /// Create a storage adapter rooted at `root` on the given backend.
    pub fn new(kv: Arc<dyn KvBackend>, root: impl Into<String>) -> Self {
        Self {
            kv,
            root: root.into(),
            max_scan_limit: DEFAULT_MAX_SCAN_LIMIT,
        }
    }

    /// Set the page size for range scans.
    pub fn with_max_scan_limit(mut self, limit: usize) -> Self {
        self.max_scan_limit = limit.max(1);
        self
    }

    /// The backend this storage writes through.
    pub fn kv(&self) -> Arc<dyn KvBackend> {
        Arc::clone(&self.kv)
    }

    /// The root path of the key namespace.
    pub fn root(&self) -> &str {
        &self.root
    }

    // ── Cluster info ───────────────────────────────────────────────

    /// Persist a new cluster record. Fails if the ID is taken.
    pub async fn create_cluster(&self, cluster: &Cluster) -> StorageResult<()> {
        let key = keys::cluster_key(&self.root, cluster.id);
        let value = encode(cluster)?;
        let resp = self
            .kv
            .txn(TxnRequest::when(
                vec![Compare::KeyMissing { key: key.clone() }],
                vec![TxnOp::Put { key, value }],
            ))
            .await
            .map_err(|e| StorageError::backend("create cluster", e))?;
        if !resp.succeeded {
            return Err(StorageError::AlreadyExists(format!(
                "cluster {}",
                cluster.id
            )));
        }
        debug!(cluster = cluster.id, name = %cluster.name, "cluster created");
        Ok(())
    }

    /// Read a cluster record.
    pub async fn get_cluster(&self, cluster_id: ClusterId) -> StorageResult<Cluster> {
        let key = keys::cluster_key(&self.root, cluster_id);
        let kv = self
            .kv
            .get(&key)
            .await
            .map_err(|e| StorageError::backend("get cluster", e))?
            .ok_or_else(|| StorageError::NotFound(format!("cluster {cluster_id}")))?;
        decode(&kv)
    }

    /// List all cluster records.
    pub async fn list_clusters(&self) -> StorageResult<Vec<Cluster>> {
        let prefix = keys::cluster_prefix(&self.root);
        let kvs = self.scan_prefix(&prefix).await?;
        kvs.iter().map(decode).collect()
    }

    // ── Cluster view ───────────────────────────────────────────────

    /// Create the initial cluster view. The latest-version key must not
    /// exist yet.
    pub async fn create_cluster_view(&self, view: &ClusterView) -> StorageResult<()> {
        let latest_key = keys::cluster_view_latest_version_key(&self.root, view.cluster_id);
        let blob_key = keys::cluster_view_key(&self.root, view.cluster_id, view.version);
        let resp = self
            .kv
            .txn(TxnRequest::when(
                vec![Compare::KeyMissing {
                    key: latest_key.clone(),
                }],
                vec![
                    TxnOp::Put {
                        key: latest_key,
                        value: encode_version(view.version),
                    },
                    TxnOp::Put {
                        key: blob_key,
                        value: encode(view)?,
                    },
                ],
            ))
            .await
            .map_err(|e| StorageError::backend("create cluster view", e))?;
        if !resp.succeeded {
            return Err(StorageError::AlreadyExists(format!(
                "cluster view for cluster {}",
                view.cluster_id
            )));
        }
        Ok(())
    }

    /// Commit a new cluster view iff the stored latest version equals
    /// `latest_version` (the version the caller's view is based on).
    pub async fn update_cluster_view(
        &self,
        view: &ClusterView,
        latest_version: u64,
    ) -> StorageResult<()> {
        let latest_key = keys::cluster_view_latest_version_key(&self.root, view.cluster_id);
        let blob_key = keys::cluster_view_key(&self.root, view.cluster_id, view.version);
        let resp = self
            .kv
            .txn(TxnRequest::when(
                vec![Compare::ValueEquals {
                    key: latest_key.clone(),
                    value: encode_version(latest_version),
                }],
                vec![
                    TxnOp::Put {
                        key: latest_key,
                        value: encode_version(view.version),
                    },
                    TxnOp::Put {
                        key: blob_key,
                        value: encode(view)?,
                    },
                ],
            ))
            .await
            .map_err(|e| StorageError::backend("update cluster view", e))?;
        if !resp.succeeded {
            return Err(StorageError::VersionMismatch {
                entity: format!("cluster view {}", view.cluster_id),
                expected: latest_version,
            });
        }
        debug!(
            cluster = view.cluster_id,
            version = view.version,
            "cluster view updated"
        );
        Ok(())
    }

    /// Read the current cluster view (latest version, then its blob).
    pub async fn get_cluster_view(&self, cluster_id: ClusterId) -> StorageResult<ClusterView> {
        let latest_key = keys::cluster_view_latest_version_key(&self.root, cluster_id);
        let latest = self
            .kv
            .get(&latest_key)
            .await
            .map_err(|e| StorageError::backend("get cluster view version", e))?
            .ok_or_else(|| StorageError::NotFound(format!("cluster view {cluster_id}")))?;
        let version = decode_version(&latest)?;

        let blob_key = keys::cluster_view_key(&self.root, cluster_id, version);
        let kv = self
            .kv
            .get(&blob_key)
            .await
            .map_err(|e| StorageError::backend("get cluster view", e))?
            .ok_or_else(|| StorageError::Corrupt {
                key: blob_key.clone(),
                reason: format!("latest version {version} has no blob"),
            })?;
        decode(&kv)
    }

    // ── Shard views ────────────────────────────────────────────────

    /// Create the initial view for each listed shard. Each view is its
    /// own transaction; on failure, the shards committed so far are
    /// named so the caller can reconcile.
    pub async fn create_shard_views(
        &self,
        cluster_id: ClusterId,
        views: &[ShardView],
    ) -> StorageResult<()> {
        let mut committed: Vec<ShardId> = Vec::with_capacity(views.len());
        for view in views {
            match self.create_shard_view(cluster_id, view).await {
                Ok(()) => committed.push(view.shard_id),
                Err(StorageError::AlreadyExists(what)) => {
                    return Err(StorageError::AlreadyExists(format!(
                        "{what} (already committed: {committed:?})"
                    )));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn create_shard_view(&self, cluster_id: ClusterId, view: &ShardView) -> StorageResult<()> {
        let latest_key = keys::shard_view_latest_version_key(&self.root, cluster_id, view.shard_id);
        let blob_key = keys::shard_view_key(&self.root, cluster_id, view.shard_id, view.version);
        let resp = self
            .kv
            .txn(TxnRequest::when(
                vec![Compare::KeyMissing {
                    key: latest_key.clone(),
                }],
                vec![
                    TxnOp::Put {
                        key: latest_key,
                        value: encode_version(view.version),
                    },
                    TxnOp::Put {
                        key: blob_key,
                        value: encode(view)?,
                    },
                ],
            ))
            .await
            .map_err(|e| StorageError::backend("create shard view", e))?;
        if !resp.succeeded {
            return Err(StorageError::AlreadyExists(format!(
                "shard view {}",
                view.shard_id
            )));
        }
        Ok(())
    }

    /// Commit a new shard view iff the stored latest version equals
    /// `latest_version`.
    pub async fn update_shard_view(
        &self,
        cluster_id: ClusterId,
        view: &ShardView,
        latest_version: u64,
    ) -> StorageResult<()> {
        let latest_key = keys::shard_view_latest_version_key(&self.root, cluster_id, view.shard_id);
        let blob_key = keys::shard_view_key(&self.root, cluster_id, view.shard_id, view.version);
        let resp = self
            .kv
            .txn(TxnRequest::when(
                vec![Compare::ValueEquals {
                    key: latest_key.clone(),
                    value: encode_version(latest_version),
                }],
                vec![
                    TxnOp::Put {
                        key: latest_key,
                        value: encode_version(view.version),
                    },
                    TxnOp::Put {
                        key: blob_key,
                        value: encode(view)?,
                    },
                ],
            ))
            .await
            .map_err(|e| StorageError::backend("update shard view", e))?;
        if !resp.succeeded {
            return Err(StorageError::VersionMismatch {
                entity: format!("shard view {}", view.shard_id),
                expected: latest_version,
            });
        }
        debug!(
            cluster = cluster_id,
            shard = view.shard_id,
            version = view.version,
            "shard view updated"
        );
        Ok(())
    }

    /// Read the current view of each listed shard. Shards with no view
    /// yet are omitted.
    pub async fn list_shard_views(
        &self,
        cluster_id: ClusterId,
        shard_ids: &[ShardId],
    ) -> StorageResult<Vec<ShardView>> {
        let mut views = Vec::with_capacity(shard_ids.len());
        for &shard_id in shard_ids {
            let latest_key = keys::shard_view_latest_version_key(&self.root, cluster_id, shard_id);
            let Some(latest) = self
                .kv
                .get(&latest_key)
                .await
                .map_err(|e| StorageError::backend("get shard view version", e))?
            else {
                continue;
            };
            let version = decode_version(&latest)?;

            let blob_key = keys::shard_view_key(&self.root, cluster_id, shard_id, version);
            let kv = self
                .kv
                .get(&blob_key)
                .await
                .map_err(|e| StorageError::backend("get shard view", e))?
                .ok_or_else(|| StorageError::Corrupt {
                    key: blob_key.clone(),
                    reason: format!("latest version {version} has no blob"),
                })?;
            views.push(decode(&kv)?);
        }
        Ok(views)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub async fn put_node(&self, cluster_id: ClusterId, node: &Node) -> StorageResult<()> {
        let key = keys::node_key(&self.root, cluster_id, &node.name);
        self.kv
            .put(&key, encode(node)?)
            .await
            .map_err(|e| StorageError::backend("put node", e))
    }

    /// Read a node record.
    pub async fn get_node(
        &self,
        cluster_id: ClusterId,
        node_name: &str,
    ) -> StorageResult<Option<Node>> {
        let key = keys::node_key(&self.root, cluster_id, node_name);
        match self
            .kv
            .get(&key)
            .await
            .map_err(|e| StorageError::backend("get node", e))?
        {
            Some(kv) => Ok(Some(decode(&kv)?)),
            None => Ok(None),
        }
    }

    /// List all nodes of a cluster (paged range scan).
    pub async fn list_nodes(&self, cluster_id: ClusterId) -> StorageResult<Vec<Node>> {
        let prefix = keys::node_prefix(&self.root, cluster_id);
        let kvs = self.scan_prefix(&prefix).await?;
        kvs.iter().map(decode).collect()
    }

    // ── Schemas ────────────────────────────────────────────────────

    /// Persist a new schema record. Fails if the ID is taken.
    pub async fn create_schema(&self, cluster_id: ClusterId, schema: &Schema) -> StorageResult<()> {
        let key = keys::schema_key(&self.root, cluster_id, schema.id);
        let resp = self
            .kv
            .txn(TxnRequest::when(
                vec![Compare::KeyMissing { key: key.clone() }],
                vec![TxnOp::Put {
                    key,
                    value: encode(schema)?,
                }],
            ))
            .await
            .map_err(|e| StorageError::backend("create schema", e))?;
        if !resp.succeeded {
            return Err(StorageError::AlreadyExists(format!("schema {}", schema.id)));
        }
        Ok(())
    }

    /// List all schemas of a cluster.
    pub async fn list_schemas(&self, cluster_id: ClusterId) -> StorageResult<Vec<Schema>> {
        let prefix = keys::schema_prefix(&self.root, cluster_id);
        let kvs = self.scan_prefix(&prefix).await?;
        kvs.iter().map(decode).collect()
    }

    // ── Tables ─────────────────────────────────────────────────────

    /// Persist a table record and its name→ID mapping in one
    /// transaction. Fails with `AlreadyExists` when the name is taken.
    pub async fn create_table(&self, cluster_id: ClusterId, table: &Table) -> StorageResult<()> {
        let name_key =
            keys::table_name_to_id_key(&self.root, cluster_id, table.schema_id, &table.name);
        let blob_key = keys::table_key(&self.root, cluster_id, table.schema_id, table.id);
        let resp = self
            .kv
            .txn(TxnRequest::when(
                vec![Compare::KeyMissing {
                    key: name_key.clone(),
                }],
                vec![
                    TxnOp::Put {
                        key: name_key,
                        value: encode_version(table.id),
                    },
                    TxnOp::Put {
                        key: blob_key,
                        value: encode(table)?,
                    },
                ],
            ))
            .await
            .map_err(|e| StorageError::backend("create table", e))?;
        if !resp.succeeded {
            return Err(StorageError::AlreadyExists(format!(
                "table {} in schema {}",
                table.name, table.schema_id
            )));
        }
        debug!(
            cluster = cluster_id,
            schema = table.schema_id,
            table = table.id,
            name = %table.name,
            "table created"
        );
        Ok(())
    }

    /// Resolve a table by name via the name→ID mapping.
    pub async fn get_table_by_name(
        &self,
        cluster_id: ClusterId,
        schema_id: SchemaId,
        table_name: &str,
    ) -> StorageResult<Option<Table>> {
        let name_key = keys::table_name_to_id_key(&self.root, cluster_id, schema_id, table_name);
        let Some(mapping) = self
            .kv
            .get(&name_key)
            .await
            .map_err(|e| StorageError::backend("get table id", e))?
        else {
            return Ok(None);
        };
        let table_id = decode_version(&mapping)?;

        let blob_key = keys::table_key(&self.root, cluster_id, schema_id, table_id);
        let kv = self
            .kv
            .get(&blob_key)
            .await
            .map_err(|e| StorageError::backend("get table", e))?
            .ok_or_else(|| StorageError::Corrupt {
                key: blob_key.clone(),
                reason: format!("name maps to {table_id} but blob is missing"),
            })?;
        Ok(Some(decode(&kv)?))
    }

    /// Delete a table record and its name→ID mapping in one
    /// transaction. Returns whether the table existed.
    pub async fn delete_table(
        &self,
        cluster_id: ClusterId,
        schema_id: SchemaId,
        table_name: &str,
    ) -> StorageResult<bool> {
        let Some(table) = self
            .get_table_by_name(cluster_id, schema_id, table_name)
            .await?
        else {
            return Ok(false);
        };
        let name_key = keys::table_name_to_id_key(&self.root, cluster_id, schema_id, table_name);
        let blob_key = keys::table_key(&self.root, cluster_id, schema_id, table.id);
        self.kv
            .txn(TxnRequest {
                compare: Vec::new(),
                success: vec![TxnOp::Delete { key: name_key }, TxnOp::Delete { key: blob_key }],
                failure: Vec::new(),
            })
            .await
            .map_err(|e| StorageError::backend("delete table", e))?;
        Ok(true)
    }

    /// List all tables of a schema.
    pub async fn list_tables(
        &self,
        cluster_id: ClusterId,
        schema_id: SchemaId,
    ) -> StorageResult<Vec<Table>> {
        let prefix = keys::table_prefix(&self.root, cluster_id, schema_id);
        let kvs = self.scan_prefix(&prefix).await?;
        kvs.iter().map(decode).collect()
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Scan every key under a prefix, paging by `max_scan_limit`.
    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<KeyValue>> {
        let mut out: Vec<KeyValue> = Vec::new();
        let mut from_key: Option<String> = None;
        loop {
            let page = self
                .kv
                .range(prefix, self.max_scan_limit, from_key.as_deref())
                .await
                .map_err(|e| StorageError::backend("range scan", e))?;
            let page_len = page.len();
            out.extend(page);
            if page_len < self.max_scan_limit {
                break;
            }
            from_key = out.last().map(|kv| kv.key.clone());
        }
        Ok(out)
    }
}

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(kv: &KeyValue) -> StorageResult<T> {
    serde_json::from_slice(&kv.value).map_err(|e| StorageError::Corrupt {
        key: kv.key.clone(),
        reason: e.to_string(),
    })
}

/// Counters (versions, name→ID mappings) are stored as decimal strings
/// so transaction value compares work on the obvious representation.
fn encode_version(version: u64) -> Vec<u8> {
    version.to_string().into_bytes()
}

fn decode_version(kv: &KeyValue) -> StorageResult<u64> {
    std::str::from_utf8(&kv.value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StorageError::Corrupt {
            key: kv.key.clone(),
            reason: "invalid counter value".to_string(),
        })
}
