//! Error types for coordinator procedures.

use thiserror::Error;

use chronogrid_topology::TopologyError;

/// Result type alias for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors that can occur while driving a procedure.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A shard action could not be delivered to a node.
    #[error("dispatch to {node} failed: {reason}")]
    Dispatch { node: String, reason: String },

    /// An event is not legal in the procedure's current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
}
