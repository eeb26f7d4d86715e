//! One replica of the metadata service and its election operations.
//!
//! The leader is represented by a single key on the KV backend holding
//! the winner's descriptor, attached to the winner's lease so the key
//! vanishes when the lease expires. Campaigning is a create-if-absent
//! transaction; resetting deletes the key only when this member owns
//! it; observers watch the key for changes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use chronogrid_kv::{Compare, KvBackend, TxnOp, TxnRequest};
use chronogrid_storage::keys;

use crate::error::{MemberError, MemberResult};
use crate::lease::Lease;

/// Identity of one metadata replica, stored under the leader key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    /// The replica's ID in the consensus backend.
    pub id: u64,
    pub name: String,
    /// Endpoint data-plane nodes use to reach this replica.
    pub endpoint: String,
}

/// Result of a leader read: the descriptor (if any) and the revision to
/// watch from.
#[derive(Debug, Clone)]
pub struct LeaderResponse {
    pub leader: Option<MemberDescriptor>,
    pub revision: u64,
}

/// Leadership as published to the rest of the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadershipState {
    /// The current meta-leader, when known.
    pub leader: Option<MemberDescriptor>,
    /// Whether this process is that leader.
    pub is_self: bool,
}

/// One replica: campaigns for the leader key and observes it.
pub struct Member {
    descriptor: MemberDescriptor,
    kv: Arc<dyn KvBackend>,
    leader_key: String,
    rpc_timeout: Duration,
    lease_ttl_sec: i64,
    leadership_tx: watch::Sender<LeadershipState>,
}

impl Member {
    pub fn new(
        descriptor: MemberDescriptor,
        kv: Arc<dyn KvBackend>,
        root_path: &str,
        rpc_timeout: Duration,
        lease_ttl_sec: i64,
    ) -> Self {
        let (leadership_tx, _) = watch::channel(LeadershipState::default());
        Self {
            descriptor,
            kv,
            leader_key: keys::leader_key(root_path),
            rpc_timeout,
            lease_ttl_sec,
            leadership_tx,
        }
    }

    pub fn descriptor(&self) -> &MemberDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    /// Subscribe to leadership changes.
    pub fn leadership(&self) -> watch::Receiver<LeadershipState> {
        self.leadership_tx.subscribe()
    }

    pub(crate) fn publish_leadership(&self, state: LeadershipState) {
        self.leadership_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Non-blocking read of the leader key.
    pub async fn get_leader(&self) -> MemberResult<LeaderResponse> {
        let kv = tokio::time::timeout(self.rpc_timeout, self.kv.get(&self.leader_key))
            .await
            .map_err(|_| MemberError::Timeout("get leader".to_string()))?
            .map_err(|e| MemberError::backend("get leader", e))?;
        match kv {
            Some(kv) => {
                let leader: MemberDescriptor = serde_json::from_slice(&kv.value)?;
                Ok(LeaderResponse {
                    leader: Some(leader),
                    revision: kv.mod_revision,
                })
            }
            None => Ok(LeaderResponse {
                leader: None,
                revision: 0,
            }),
        }
    }

    /// Campaign for leadership and, on success, hold it until the lease
    /// is lost or `shutdown` trips.
    ///
    /// Returns `CampaignLost` when another member owns the key. On
    /// return from a won campaign the leader key has been released
    /// (best effort) and leadership is republished as vacated.
    pub async fn campaign_and_keep_leader(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MemberResult<()> {
        let lease = Lease::grant(Arc::clone(&self.kv), self.lease_ttl_sec, self.rpc_timeout).await?;

        let value = serde_json::to_vec(&self.descriptor)?;
        let resp = self
            .kv
            .txn(TxnRequest::when(
                vec![Compare::KeyMissing {
                    key: self.leader_key.clone(),
                }],
                vec![TxnOp::PutWithLease {
                    key: self.leader_key.clone(),
                    value,
                    lease: lease.id(),
                }],
            ))
            .await
            .map_err(|e| MemberError::backend("campaign", e))?;
        if !resp.succeeded {
            if let Err(err) = lease.revoke().await {
                warn!(error = %err, "failed to revoke lease after lost campaign");
            }
            return Err(MemberError::CampaignLost);
        }

        info!(member = %self.descriptor.name, "campaign won, holding leadership");
        self.publish_leadership(LeadershipState {
            leader: Some(self.descriptor.clone()),
            is_self: true,
        });

        lease.keep_alive(shutdown).await;

        // Leadership over: drop the key if it is still ours and release
        // the lease. Both best effort; expiry gets there regardless.
        if let Err(err) = self.reset_leader().await {
            warn!(error = %err, "failed to release leader key");
        }
        if let Err(err) = lease.revoke().await {
            warn!(error = %err, "failed to revoke lease");
        }
        self.publish_leadership(LeadershipState::default());
        info!(member = %self.descriptor.name, "leadership released");
        Ok(())
    }

    /// Delete the leader key, but only if this member owns it.
    pub async fn reset_leader(&self) -> MemberResult<()> {
        let value = serde_json::to_vec(&self.descriptor)?;
        let resp = self
            .kv
            .txn(TxnRequest::when(
                vec![Compare::ValueEquals {
                    key: self.leader_key.clone(),
                    value,
                }],
                vec![TxnOp::Delete {
                    key: self.leader_key.clone(),
                }],
            ))
            .await
            .map_err(|e| MemberError::backend("reset leader", e))?;
        if !resp.succeeded {
            return Err(MemberError::NotLeaderOwner);
        }
        info!(member = %self.descriptor.name, "leader key reset");
        Ok(())
    }

    /// Block until the leader key changes past `from_revision` or
    /// `shutdown` trips.
    pub async fn wait_for_leader_change(
        &self,
        from_revision: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MemberResult<()> {
        let mut events = self
            .kv
            .watch(&self.leader_key, from_revision)
            .await
            .map_err(|e| MemberError::backend("watch leader", e))?;
        tokio::select! {
            event = events.recv() => match event {
                Some(_) => Ok(()),
                None => Err(MemberError::WatchClosed),
            },
            _ = shutdown.changed() => Ok(()),
        }
    }
}
