//! Coordinator procedures for the ChronoGrid metadata service.
//!
//! Procedures orchestrate data-plane actions (dispatched to nodes) with
//! topology commits. The transfer-leader procedure moves a shard's
//! leader replica from one node to another: close on the old node, open
//! on the new one, then commit the updated cluster view.

pub mod dispatch;
pub mod error;
pub mod transfer_leader;

pub use dispatch::ShardDispatch;
pub use error::{CoordinatorError, CoordinatorResult};
pub use transfer_leader::{
    transition, TransferLeaderAction, TransferLeaderEvent, TransferLeaderProcedure,
    TransferLeaderState,
};
