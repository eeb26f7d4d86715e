//! Typed metadata storage for the ChronoGrid control plane.
//!
//! Persists cluster, topology, node, schema, and table records as JSON
//! blobs under a versioned key namespace on the KV backend. Versioned
//! entities (cluster view, shard views) are written with optimistic
//! compare-and-set against a `latest_version` key.
//!
//! - **`keys`** — key-path schema (deterministic, zero-padded IDs)
//! - **`types`** — persisted entities and their states
//! - **`store`** — `MetaStorage`, the transactional typed adapter
//! - **`id_alloc`** — block-based monotonic ID allocator

pub mod error;
pub mod id_alloc;
pub mod keys;
pub mod store;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use id_alloc::IdAllocator;
pub use store::MetaStorage;
pub use types::*;
