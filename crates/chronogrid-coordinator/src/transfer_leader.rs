//! Transfer-leader procedure.
//!
//! Moves a shard's leader replica from one node to another. The state
//! machine is a typed event enum with a pure transition function; side
//! effects come back as an action list the driver executes in order:
//!
//! ```text
//! Begin --Prepare--> Waiting --Success--> Finish
//!                      |  \--Failed----> Failed
//!                      \----Cancel-----> Cancelled
//! ```
//!
//! `Prepare` closes the shard on the old leader and opens it on the new
//! one; `Success` commits the reassigned cluster view. Failure performs
//! no rollback: the `Failed` state carries the dispatch error and any
//! already-issued actions stand.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use chronogrid_storage::{ShardId, ShardNode, ShardRole};
use chronogrid_topology::TopologyManager;

use crate::dispatch::ShardDispatch;
use crate::error::{CoordinatorError, CoordinatorResult};

/// States of the transfer-leader procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferLeaderState {
    Begin,
    Waiting,
    Finish,
    Failed { reason: String },
    Cancelled,
}

/// Events fed to the transition function.
#[derive(Debug, Clone)]
pub enum TransferLeaderEvent {
    Prepare,
    Success,
    Failed { reason: String },
    Cancel,
}

/// Side effects returned by a transition, executed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferLeaderAction {
    CloseShard { node: String, shard_id: ShardId },
    OpenShard { node: String, shard_id: ShardId },
    CommitView,
}

/// Pure transition: next state plus the actions to execute.
pub fn transition(
    state: &TransferLeaderState,
    event: TransferLeaderEvent,
    old_leader: &ShardNode,
    new_leader: &ShardNode,
) -> CoordinatorResult<(TransferLeaderState, Vec<TransferLeaderAction>)> {
    use TransferLeaderEvent as Event;
    use TransferLeaderState as State;

    match (state, event) {
        (State::Begin, Event::Prepare) => Ok((
            State::Waiting,
            vec![
                TransferLeaderAction::CloseShard {
                    node: old_leader.node_name.clone(),
                    shard_id: old_leader.shard_id,
                },
                TransferLeaderAction::OpenShard {
                    node: new_leader.node_name.clone(),
                    shard_id: new_leader.shard_id,
                },
            ],
        )),
        (State::Waiting, Event::Success) => {
            Ok((State::Finish, vec![TransferLeaderAction::CommitView]))
        }
        (State::Waiting, Event::Failed { reason }) => Ok((State::Failed { reason }, Vec::new())),
        (State::Waiting, Event::Cancel) => Ok((State::Cancelled, Vec::new())),
        (state, event) => Err(CoordinatorError::InvalidTransition(format!(
            "event {event:?} in state {state:?}"
        ))),
    }
}

/// Drives one leader transfer to completion.
pub struct TransferLeaderProcedure {
    id: u64,
    dispatch: Arc<dyn ShardDispatch>,
    topology: Arc<TopologyManager>,
    old_leader: ShardNode,
    new_leader: ShardNode,
    state: Mutex<TransferLeaderState>,
}

impl TransferLeaderProcedure {
    pub fn new(
        id: u64,
        dispatch: Arc<dyn ShardDispatch>,
        topology: Arc<TopologyManager>,
        old_leader: ShardNode,
        new_leader: ShardNode,
    ) -> Self {
        Self {
            id,
            dispatch,
            topology,
            old_leader,
            new_leader,
            state: Mutex::new(TransferLeaderState::Begin),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn state(&self) -> TransferLeaderState {
        self.state.lock().await.clone()
    }

    /// Run the procedure: prepare (dispatch), then commit. Any dispatch
    /// error moves the procedure to `Failed` and is returned; `cancel`
    /// is threaded into the topology commit.
    pub async fn start(&self, cancel: &mut watch::Receiver<bool>) -> CoordinatorResult<()> {
        self.step(TransferLeaderEvent::Prepare, cancel).await?;
        self.step(TransferLeaderEvent::Success, cancel).await?;
        info!(
            procedure = self.id,
            shard = self.old_leader.shard_id,
            from = %self.old_leader.node_name,
            to = %self.new_leader.node_name,
            "leader transferred"
        );
        Ok(())
    }

    /// Cancel from `Waiting`. No rollback is attempted.
    pub async fn cancel(&self) -> CoordinatorResult<()> {
        let mut never = watch::channel(false).1;
        self.step(TransferLeaderEvent::Cancel, &mut never).await
    }

    /// Apply one event: transition, execute the returned actions, and
    /// record the failure state if an action errors.
    async fn step(
        &self,
        event: TransferLeaderEvent,
        cancel: &mut watch::Receiver<bool>,
    ) -> CoordinatorResult<()> {
        let mut state = self.state.lock().await;
        let (next, actions) = transition(&state, event, &self.old_leader, &self.new_leader)?;
        *state = next;

        for action in actions {
            if let Err(err) = self.execute(&action, cancel).await {
                warn!(
                    procedure = self.id,
                    ?action,
                    error = %err,
                    "transfer-leader action failed"
                );
                *state = TransferLeaderState::Failed {
                    reason: err.to_string(),
                };
                return Err(err);
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        action: &TransferLeaderAction,
        cancel: &mut watch::Receiver<bool>,
    ) -> CoordinatorResult<()> {
        match action {
            TransferLeaderAction::CloseShard { node, shard_id } => {
                self.dispatch.close_shard(node, *shard_id).await
            }
            TransferLeaderAction::OpenShard { node, shard_id } => {
                self.dispatch.open_shard(node, *shard_id).await
            }
            TransferLeaderAction::CommitView => self.commit_view(cancel).await,
        }
    }

    /// Replace the old leader's entry with the new leader in the
    /// cluster view and commit it optimistically.
    async fn commit_view(&self, cancel: &mut watch::Receiver<bool>) -> CoordinatorResult<()> {
        let current = self.topology.get_shard_nodes().await;
        let mut shard_nodes: Vec<ShardNode> = current
            .shard_nodes
            .into_iter()
            .filter(|sn| {
                !(sn.shard_id == self.old_leader.shard_id
                    && sn.node_name == self.old_leader.node_name)
            })
            .collect();
        shard_nodes.push(ShardNode {
            shard_id: self.new_leader.shard_id,
            node_name: self.new_leader.node_name.clone(),
            role: ShardRole::Leader,
        });

        let state = self.topology.get_cluster_state().await;
        self.topology
            .update_cluster_view(state, shard_nodes, cancel)
            .await?;
        Ok(())
    }
}
