//! Lease held by a campaigning member.
//!
//! Wraps a lease granted by the KV backend and keeps it alive: a ticker
//! fires every `rpc_timeout / 3`, each renewal runs as a detached task
//! bounded by `rpc_timeout`, and successful renewals post the new expiry
//! back over a bounded channel. The main loop merges expiries via max
//! and exits once no renewal lands within `rpc_timeout` — at that point
//! the lease is deemed lost and the key it guards will be dropped by
//! the backend.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use chronogrid_kv::{KvBackend, LeaseId};

use crate::error::{MemberError, MemberResult};

/// Buffered expiries in flight from renewal tasks to the merge loop.
const EXPIRE_CHANNEL_CAPACITY: usize = 4;

/// A granted lease with its renewal state.
pub struct Lease {
    kv: Arc<dyn KvBackend>,
    rpc_timeout: Duration,
    ttl_sec: i64,
    id: LeaseId,
    expire_at: RwLock<Instant>,
}

impl Lease {
    /// Grant a lease with `ttl_sec` on the backend.
    pub async fn grant(
        kv: Arc<dyn KvBackend>,
        ttl_sec: i64,
        rpc_timeout: Duration,
    ) -> MemberResult<Self> {
        let grant = tokio::time::timeout(rpc_timeout, kv.lease_grant(ttl_sec))
            .await
            .map_err(|_| MemberError::LeaseGrantFailed("grant timed out".to_string()))?
            .map_err(|e| MemberError::LeaseGrantFailed(e.to_string()))?;

        let expire_at = Instant::now() + Duration::from_secs(grant.ttl_sec.max(0) as u64);
        debug!(lease = grant.id, ttl_sec = grant.ttl_sec, "lease granted");
        Ok(Self {
            kv,
            rpc_timeout,
            ttl_sec,
            id: grant.id,
            expire_at: RwLock::new(expire_at),
        })
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn ttl_sec(&self) -> i64 {
        self.ttl_sec
    }

    /// Whether the lease has passed its last known expiry.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= *self.expire_at.read().unwrap()
    }

    fn set_expire_at(&self, new_expire_at: Instant) {
        let mut expire_at = self.expire_at.write().unwrap();
        if new_expire_at > *expire_at {
            *expire_at = new_expire_at;
        }
    }

    /// Keep the lease alive until it is lost or `shutdown` trips.
    ///
    /// Returns when no successful renewal lands within `rpc_timeout`
    /// (lease lost) or on shutdown. The caller decides what losing the
    /// lease means; this method only tracks expiry.
    pub async fn keep_alive(&self, shutdown: &mut watch::Receiver<bool>) {
        let (expire_tx, mut expire_rx) = mpsc::channel(EXPIRE_CHANNEL_CAPACITY);
        let renewer = tokio::spawn(renew_loop(
            Arc::clone(&self.kv),
            self.id,
            self.rpc_timeout / 3,
            self.rpc_timeout,
            expire_tx,
            shutdown.clone(),
        ));

        info!(lease = self.id, "keep-alive started");
        loop {
            tokio::select! {
                received = expire_rx.recv() => match received {
                    Some(expire_at) => self.set_expire_at(expire_at),
                    None => break,
                },
                _ = tokio::time::sleep(self.rpc_timeout) => {
                    info!(lease = self.id, "no renewal within rpc timeout, lease lost");
                    break;
                }
                _ = shutdown.changed() => {
                    info!(lease = self.id, "keep-alive stopped by shutdown");
                    break;
                }
            }
        }

        renewer.abort();
        let _ = renewer.await;
    }

    /// Revoke the lease on the backend.
    pub async fn revoke(&self) -> MemberResult<()> {
        tokio::time::timeout(self.rpc_timeout, self.kv.lease_revoke(self.id))
            .await
            .map_err(|_| MemberError::LeaseRevokeFailed("revoke timed out".to_string()))?
            .map_err(|e| MemberError::LeaseRevokeFailed(e.to_string()))
    }
}

/// Fire a renewal every `interval`; each renewal is a detached task
/// bounded by `rpc_timeout` that posts the resulting expiry.
async fn renew_loop(
    kv: Arc<dyn KvBackend>,
    lease: LeaseId,
    interval: Duration,
    rpc_timeout: Duration,
    expire_tx: mpsc::Sender<Instant>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        let kv = Arc::clone(&kv);
        let expire_tx = expire_tx.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            match tokio::time::timeout(rpc_timeout, kv.lease_keep_alive_once(lease)).await {
                Ok(Ok(ttl)) if ttl > 0 => {
                    let _ = expire_tx.try_send(start + Duration::from_secs(ttl as u64));
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(lease, error = %err, "lease renewal failed"),
                Err(_) => warn!(lease, "lease renewal timed out"),
            }
        });

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
    }
}
