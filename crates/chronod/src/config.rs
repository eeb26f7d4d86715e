//! chronod configuration.
//!
//! Loaded from a TOML file, then overridden by `CHRONOD_*` environment
//! variables, then by CLI flags (low to high priority). Field names and
//! defaults cover the metadata service itself plus the bootstrap
//! options handed to the embedded consensus KV backend.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Deadline for handling one inbound RPC.
    pub grpc_handle_timeout_ms: i64,
    /// Deadline for the embedded backend to come up.
    pub etcd_start_timeout_ms: i64,
    /// Deadline for one call to the backend.
    pub etcd_call_timeout_ms: i64,

    /// Leader lease TTL in seconds.
    pub lease_sec: i64,

    pub node_name: String,
    pub data_dir: String,
    pub wal_dir: String,
    /// Root of the metadata key namespace.
    pub storage_root_path: String,

    // Consensus bootstrap, passed through to the embedded backend.
    pub initial_cluster: String,
    /// "new" or "existing".
    pub initial_cluster_state: String,
    pub initial_cluster_token: String,
    pub client_urls: String,
    pub peer_urls: String,
    pub advertise_client_urls: String,
    pub advertise_peer_urls: String,
    pub tick_interval_ms: i64,
    pub election_timeout_ms: i64,
    pub quota_backend_bytes: i64,
    /// "periodic" or "revision".
    pub auto_compaction_mode: String,
    pub auto_compaction_retention: String,
    pub max_request_bytes: u64,

    pub max_scan_limit: usize,
    pub min_scan_limit: usize,
    pub id_allocator_step: u64,

    // Settings of the default cluster created at bootstrap.
    pub default_cluster_name: String,
    pub default_cluster_node_count: u32,
    pub default_cluster_replication_factor: u32,
    pub default_cluster_shard_total: u32,

    pub http_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grpc_handle_timeout_ms: 10_000,
            etcd_start_timeout_ms: 10_000,
            etcd_call_timeout_ms: 5_000,
            lease_sec: 10,
            node_name: "chronod0".to_string(),
            data_dir: "/tmp/chronogrid/data".to_string(),
            wal_dir: "/tmp/chronogrid/wal".to_string(),
            storage_root_path: "/chronogrid".to_string(),
            initial_cluster: "chronod0=http://127.0.0.1:2380".to_string(),
            initial_cluster_state: "new".to_string(),
            initial_cluster_token: "chronogrid-meta".to_string(),
            client_urls: "http://0.0.0.0:2379".to_string(),
            peer_urls: "http://0.0.0.0:2380".to_string(),
            advertise_client_urls: "http://127.0.0.1:2379".to_string(),
            advertise_peer_urls: "http://127.0.0.1:2380".to_string(),
            tick_interval_ms: 500,
            election_timeout_ms: 3_000,
            quota_backend_bytes: 8 * 1024 * 1024 * 1024,
            auto_compaction_mode: "periodic".to_string(),
            auto_compaction_retention: "1h".to_string(),
            max_request_bytes: 2 * 1024 * 1024,
            max_scan_limit: 100,
            min_scan_limit: 20,
            id_allocator_step: 20,
            default_cluster_name: "defaultCluster".to_string(),
            default_cluster_node_count: 2,
            default_cluster_replication_factor: 1,
            default_cluster_shard_total: 8,
            http_port: 8080,
        }
    }
}

impl Config {
    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Apply `CHRONOD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        override_parse(&mut self.grpc_handle_timeout_ms, "GRPC_HANDLE_TIMEOUT_MS")?;
        override_parse(&mut self.etcd_start_timeout_ms, "ETCD_START_TIMEOUT_MS")?;
        override_parse(&mut self.etcd_call_timeout_ms, "ETCD_CALL_TIMEOUT_MS")?;
        override_parse(&mut self.lease_sec, "LEASE_SEC")?;
        override_string(&mut self.node_name, "NODE_NAME");
        override_string(&mut self.data_dir, "DATA_DIR");
        override_string(&mut self.wal_dir, "WAL_DIR");
        override_string(&mut self.storage_root_path, "STORAGE_ROOT_PATH");
        override_string(&mut self.initial_cluster, "INITIAL_CLUSTER");
        override_string(&mut self.initial_cluster_state, "INITIAL_CLUSTER_STATE");
        override_string(&mut self.initial_cluster_token, "INITIAL_CLUSTER_TOKEN");
        override_string(&mut self.client_urls, "CLIENT_URLS");
        override_string(&mut self.peer_urls, "PEER_URLS");
        override_string(&mut self.advertise_client_urls, "ADVERTISE_CLIENT_URLS");
        override_string(&mut self.advertise_peer_urls, "ADVERTISE_PEER_URLS");
        override_parse(&mut self.tick_interval_ms, "TICK_INTERVAL_MS")?;
        override_parse(&mut self.election_timeout_ms, "ELECTION_TIMEOUT_MS")?;
        override_parse(&mut self.quota_backend_bytes, "QUOTA_BACKEND_BYTES")?;
        override_string(&mut self.auto_compaction_mode, "AUTO_COMPACTION_MODE");
        override_string(&mut self.auto_compaction_retention, "AUTO_COMPACTION_RETENTION");
        override_parse(&mut self.max_request_bytes, "MAX_REQUEST_BYTES")?;
        override_parse(&mut self.max_scan_limit, "MAX_SCAN_LIMIT")?;
        override_parse(&mut self.min_scan_limit, "MIN_SCAN_LIMIT")?;
        override_parse(&mut self.id_allocator_step, "ID_ALLOCATOR_STEP")?;
        override_string(&mut self.default_cluster_name, "DEFAULT_CLUSTER_NAME");
        override_parse(&mut self.default_cluster_node_count, "DEFAULT_CLUSTER_NODE_COUNT")?;
        override_parse(
            &mut self.default_cluster_replication_factor,
            "DEFAULT_CLUSTER_REPLICATION_FACTOR",
        )?;
        override_parse(&mut self.default_cluster_shard_total, "DEFAULT_CLUSTER_SHARD_TOTAL")?;
        override_parse(&mut self.http_port, "HTTP_PORT")?;
        Ok(())
    }

    /// Validate field values and their relationships.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            bail!("node_name must not be empty");
        }
        if self.lease_sec <= 0 {
            bail!("lease_sec must be positive, got {}", self.lease_sec);
        }
        for (name, value) in [
            ("grpc_handle_timeout_ms", self.grpc_handle_timeout_ms),
            ("etcd_start_timeout_ms", self.etcd_start_timeout_ms),
            ("etcd_call_timeout_ms", self.etcd_call_timeout_ms),
            ("tick_interval_ms", self.tick_interval_ms),
            ("election_timeout_ms", self.election_timeout_ms),
        ] {
            if value <= 0 {
                bail!("{name} must be positive, got {value}");
            }
        }
        if !self.storage_root_path.starts_with('/') {
            bail!(
                "storage_root_path must be absolute, got {:?}",
                self.storage_root_path
            );
        }
        if self.min_scan_limit == 0 || self.max_scan_limit < self.min_scan_limit {
            bail!(
                "scan limits must satisfy 1 <= min ({}) <= max ({})",
                self.min_scan_limit,
                self.max_scan_limit
            );
        }
        if self.id_allocator_step == 0 {
            bail!("id_allocator_step must be positive");
        }
        if !matches!(self.initial_cluster_state.as_str(), "new" | "existing") {
            bail!(
                "initial_cluster_state must be \"new\" or \"existing\", got {:?}",
                self.initial_cluster_state
            );
        }
        if !matches!(self.auto_compaction_mode.as_str(), "periodic" | "revision") {
            bail!(
                "auto_compaction_mode must be \"periodic\" or \"revision\", got {:?}",
                self.auto_compaction_mode
            );
        }
        if self.default_cluster_shard_total == 0 {
            bail!("default_cluster_shard_total must be positive");
        }
        Ok(())
    }

    pub fn grpc_handle_timeout(&self) -> Duration {
        Duration::from_millis(self.grpc_handle_timeout_ms as u64)
    }

    pub fn etcd_start_timeout(&self) -> Duration {
        Duration::from_millis(self.etcd_start_timeout_ms as u64)
    }

    pub fn etcd_call_timeout(&self) -> Duration {
        Duration::from_millis(self.etcd_call_timeout_ms as u64)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("CHRONOD_{key}")).ok()
}

fn override_string(target: &mut String, key: &str) {
    if let Some(value) = env_var(key) {
        *target = value;
    }
}

fn override_parse<T: std::str::FromStr>(target: &mut T, key: &str) -> anyhow::Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(value) = env_var(key) {
        *target = value
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid CHRONOD_{key}={value}: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.grpc_handle_timeout_ms, 10_000);
        assert_eq!(config.lease_sec, 10);
        assert_eq!(config.max_scan_limit, 100);
        assert_eq!(config.default_cluster_shard_total, 8);
        assert_eq!(config.http_port, 8080);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node_name = \"meta-east-1\"\nlease_sec = 20\ndefault_cluster_shard_total = 16"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.node_name, "meta-east-1");
        assert_eq!(config.lease_sec, 20);
        assert_eq!(config.default_cluster_shard_total, 16);
        // Untouched fields keep their defaults.
        assert_eq!(config.etcd_call_timeout_ms, 5_000);
    }

    #[test]
    fn unknown_fields_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no_such_option = 1").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = Config::default();
        config.lease_sec = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_scan_limit = 5;
        config.min_scan_limit = 20;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auto_compaction_mode = "sometimes".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage_root_path = "relative/path".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn timeout_accessors_convert_to_durations() {
        let config = Config::default();
        assert_eq!(config.etcd_call_timeout(), Duration::from_secs(5));
        assert_eq!(config.grpc_handle_timeout(), Duration::from_secs(10));
    }
}
