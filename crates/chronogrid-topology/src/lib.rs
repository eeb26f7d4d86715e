//! Versioned cluster topology for the ChronoGrid metadata service.
//!
//! The `TopologyManager` owns the authoritative in-memory copy of one
//! cluster's topology — shard→node placement, shard→table contents,
//! node records — kept write-through consistent with storage under
//! optimistic version checks. The `picker` module provides placement
//! policies over an immutable snapshot of that topology.

pub mod error;
pub mod manager;
pub mod picker;
pub mod types;

pub use error::{TopologyError, TopologyResult};
pub use manager::TopologyManager;
pub use picker::{LeastTablePicker, RandomBalancedPicker, ShardPicker};
pub use types::*;
