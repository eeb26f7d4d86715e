//! RPC surface of the ChronoGrid metadata service.
//!
//! `MetaService` exposes the operations data-plane nodes call: ID
//! allocation, table placement and routing, shard table listings, and
//! heartbeats. Mutations require the leader capability — followers
//! answer `NotLeader` with a hint to the current leader. Wire
//! serialization is out of scope; requests and responses are plain
//! structs.

pub mod error;
pub mod meta_service;

pub use error::{MetaError, MetaResult};
pub use meta_service::{
    LeaderHandle, MetaService, NodeHeartbeatRequest, NodeHeartbeatResponse, RouteEntry,
    RouteTablesResponse, ShardTables, TableInfo, TablePlacement,
};
