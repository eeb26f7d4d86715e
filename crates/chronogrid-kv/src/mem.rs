//! In-memory KV backend.
//!
//! Single-process implementation of [`KvBackend`] used by tests and by
//! `chronod` standalone mode. Faithful to the contract where it matters
//! to the control plane: a global revision counter, atomic transactions,
//! lease-attached keys deleted on expiry, and per-key watches.
//!
//! Lease deadlines use `tokio::time::Instant`, so tests may pause and
//! advance the clock. Expiry is applied lazily before every operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::types::*;
use crate::KvBackend;

#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    mod_revision: u64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
}

struct Watcher {
    key: String,
    from_revision: u64,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Record>,
    revision: u64,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease_id: LeaseId,
    watchers: Vec<Watcher>,
}

/// In-memory [`KvBackend`] implementation.
pub struct MemKv {
    inner: Mutex<Inner>,
    /// When set, every call fails with `Unavailable`. Used by tests to
    /// simulate an unreachable backend.
    unavailable: AtomicBool,
    /// When set, every call parks forever. Used by tests to hold a call
    /// in flight; parked futures stay parked and must be dropped.
    stalled: AtomicBool,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            unavailable: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        }
    }

    /// Toggle simulated unavailability.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Toggle simulated stalling. Calls issued while stalled never
    /// complete; un-stalling only affects calls issued afterwards.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Current global revision.
    pub fn revision(&self) -> u64 {
        self.inner.lock().unwrap().revision
    }

    async fn check_ready(&self) -> KvResult<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }

    fn lock_and_expire(&self) -> std::sync::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap();
        expire_leases(&mut inner);
        inner
    }
}

/// Drop every lease past its deadline and delete its attached keys.
fn expire_leases(inner: &mut Inner) {
    let now = Instant::now();
    let expired: Vec<LeaseId> = inner
        .leases
        .iter()
        .filter(|(_, l)| l.deadline <= now)
        .map(|(id, _)| *id)
        .collect();
    for lease in expired {
        inner.leases.remove(&lease);
        drop_lease_keys(inner, lease);
        debug!(lease, "lease expired");
    }
}

fn drop_lease_keys(inner: &mut Inner, lease: LeaseId) {
    let keys: Vec<String> = inner
        .data
        .iter()
        .filter(|(_, r)| r.lease == Some(lease))
        .map(|(k, _)| k.clone())
        .collect();
    for key in keys {
        inner.data.remove(&key);
        inner.revision += 1;
        let revision = inner.revision;
        notify(inner, WatchEvent::Delete { key, revision });
    }
}

fn notify(inner: &mut Inner, event: WatchEvent) {
    let key = match &event {
        WatchEvent::Put { kv } => kv.key.clone(),
        WatchEvent::Delete { key, .. } => key.clone(),
    };
    inner.watchers.retain(|w| {
        if w.key != key || event.revision() <= w.from_revision {
            return !w.tx.is_closed();
        }
        w.tx.send(event.clone()).is_ok()
    });
}

fn apply_op(inner: &mut Inner, op: &TxnOp) -> KvResult<TxnOpResponse> {
    match op {
        TxnOp::Put { key, value } => {
            do_put(inner, key, value.clone(), None);
            Ok(TxnOpResponse::Put)
        }
        TxnOp::PutWithLease { key, value, lease } => {
            if !inner.leases.contains_key(lease) {
                return Err(KvError::LeaseNotFound(*lease));
            }
            do_put(inner, key, value.clone(), Some(*lease));
            Ok(TxnOpResponse::Put)
        }
        TxnOp::Delete { key } => {
            let existed = do_delete(inner, key);
            Ok(TxnOpResponse::Delete { existed })
        }
        TxnOp::Get { key } => {
            let kv = inner.data.get(key).map(|r| KeyValue {
                key: key.clone(),
                value: r.value.clone(),
                mod_revision: r.mod_revision,
            });
            Ok(TxnOpResponse::Get { kv })
        }
    }
}

fn do_put(inner: &mut Inner, key: &str, value: Vec<u8>, lease: Option<LeaseId>) {
    inner.revision += 1;
    let record = Record {
        value,
        mod_revision: inner.revision,
        lease,
    };
    inner.data.insert(key.to_string(), record.clone());
    notify(
        inner,
        WatchEvent::Put {
            kv: KeyValue {
                key: key.to_string(),
                value: record.value,
                mod_revision: record.mod_revision,
            },
        },
    );
}

fn do_delete(inner: &mut Inner, key: &str) -> bool {
    if inner.data.remove(key).is_none() {
        return false;
    }
    inner.revision += 1;
    let revision = inner.revision;
    notify(
        inner,
        WatchEvent::Delete {
            key: key.to_string(),
            revision,
        },
    );
    true
}

fn holds(inner: &Inner, compare: &Compare) -> bool {
    match compare {
        Compare::ValueEquals { key, value } => {
            inner.data.get(key).is_some_and(|r| &r.value == value)
        }
        Compare::KeyMissing { key } => !inner.data.contains_key(key),
    }
}

#[async_trait]
impl KvBackend for MemKv {
    async fn txn(&self, req: TxnRequest) -> KvResult<TxnResponse> {
        self.check_ready().await?;
        let mut inner = self.lock_and_expire();

        let succeeded = req.compare.iter().all(|c| holds(&inner, c));
        let ops = if succeeded { &req.success } else { &req.failure };
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            responses.push(apply_op(&mut inner, op)?);
        }
        Ok(TxnResponse {
            succeeded,
            responses,
        })
    }

    async fn get(&self, key: &str) -> KvResult<Option<KeyValue>> {
        self.check_ready().await?;
        let inner = self.lock_and_expire();
        Ok(inner.data.get(key).map(|r| KeyValue {
            key: key.to_string(),
            value: r.value.clone(),
            mod_revision: r.mod_revision,
        }))
    }

    async fn range(
        &self,
        prefix: &str,
        limit: usize,
        from_key: Option<&str>,
    ) -> KvResult<Vec<KeyValue>> {
        self.check_ready().await?;
        let inner = self.lock_and_expire();
        let mut out = Vec::new();
        for (key, record) in inner.data.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(from) = from_key {
                if key.as_str() <= from {
                    continue;
                }
            }
            out.push(KeyValue {
                key: key.clone(),
                value: record.value.clone(),
                mod_revision: record.mod_revision,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<()> {
        self.check_ready().await?;
        let mut inner = self.lock_and_expire();
        do_put(&mut inner, key, value, None);
        Ok(())
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> KvResult<()> {
        self.check_ready().await?;
        let mut inner = self.lock_and_expire();
        if !inner.leases.contains_key(&lease) {
            return Err(KvError::LeaseNotFound(lease));
        }
        do_put(&mut inner, key, value, Some(lease));
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        self.check_ready().await?;
        let mut inner = self.lock_and_expire();
        Ok(do_delete(&mut inner, key))
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: u64,
    ) -> KvResult<mpsc::UnboundedReceiver<WatchEvent>> {
        self.check_ready().await?;
        let mut inner = self.lock_and_expire();
        let (tx, rx) = mpsc::unbounded_channel();

        // Replay the current state if it already moved past from_revision,
        // so a change between the caller's read and this registration is
        // not lost.
        if let Some(record) = inner.data.get(key) {
            if record.mod_revision > from_revision {
                let _ = tx.send(WatchEvent::Put {
                    kv: KeyValue {
                        key: key.to_string(),
                        value: record.value.clone(),
                        mod_revision: record.mod_revision,
                    },
                });
            }
        }

        inner.watchers.push(Watcher {
            key: key.to_string(),
            from_revision,
            tx,
        });
        Ok(rx)
    }

    async fn lease_grant(&self, ttl_sec: i64) -> KvResult<LeaseGrant> {
        self.check_ready().await?;
        if ttl_sec <= 0 {
            return Err(KvError::InvalidRequest(format!(
                "non-positive lease ttl: {ttl_sec}"
            )));
        }
        let mut inner = self.lock_and_expire();
        inner.next_lease_id += 1;
        let id = inner.next_lease_id;
        let ttl = Duration::from_secs(ttl_sec as u64);
        inner.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        debug!(lease = id, ttl_sec, "lease granted");
        Ok(LeaseGrant { id, ttl_sec })
    }

    async fn lease_keep_alive_once(&self, lease: LeaseId) -> KvResult<i64> {
        self.check_ready().await?;
        let mut inner = self.lock_and_expire();
        match inner.leases.get_mut(&lease) {
            Some(record) => {
                record.deadline = Instant::now() + record.ttl;
                Ok(record.ttl.as_secs() as i64)
            }
            None => Err(KvError::LeaseNotFound(lease)),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> KvResult<()> {
        self.check_ready().await?;
        let mut inner = self.lock_and_expire();
        if inner.leases.remove(&lease).is_none() {
            return Err(KvError::LeaseNotFound(lease));
        }
        drop_lease_keys(&mut inner, lease);
        debug!(lease, "lease revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv() -> MemKv {
        MemKv::new()
    }

    // ── Basic reads and writes ─────────────────────────────────────

    #[tokio::test]
    async fn put_and_get() {
        let kv = kv();
        kv.put("a", b"1".to_vec()).await.unwrap();

        let got = kv.get("a").await.unwrap().unwrap();
        assert_eq!(got.value, b"1");
        assert_eq!(got.mod_revision, 1);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let kv = kv();
        assert!(kv.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let kv = kv();
        kv.put("a", b"1".to_vec()).await.unwrap();

        assert!(kv.delete("a").await.unwrap());
        assert!(!kv.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn revisions_increase_per_write() {
        let kv = kv();
        kv.put("a", b"1".to_vec()).await.unwrap();
        kv.put("a", b"2".to_vec()).await.unwrap();

        let got = kv.get("a").await.unwrap().unwrap();
        assert_eq!(got.mod_revision, 2);
    }

    // ── Range scans ────────────────────────────────────────────────

    #[tokio::test]
    async fn range_respects_prefix_and_limit() {
        let kv = kv();
        for name in ["p/a", "p/b", "p/c", "q/x"] {
            kv.put(name, b"v".to_vec()).await.unwrap();
        }

        let page = kv.range("p/", 2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].key, "p/a");
        assert_eq!(page[1].key, "p/b");

        let rest = kv.range("p/", 10, Some("p/b")).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key, "p/c");
    }

    // ── Transactions ───────────────────────────────────────────────

    #[tokio::test]
    async fn txn_key_missing_create() {
        let kv = kv();
        let resp = kv
            .txn(TxnRequest::when(
                vec![Compare::KeyMissing {
                    key: "k".to_string(),
                }],
                vec![TxnOp::Put {
                    key: "k".to_string(),
                    value: b"v".to_vec(),
                }],
            ))
            .await
            .unwrap();
        assert!(resp.succeeded);

        // Second create fails the compare and applies nothing.
        let resp = kv
            .txn(TxnRequest::when(
                vec![Compare::KeyMissing {
                    key: "k".to_string(),
                }],
                vec![TxnOp::Put {
                    key: "k".to_string(),
                    value: b"other".to_vec(),
                }],
            ))
            .await
            .unwrap();
        assert!(!resp.succeeded);
        assert_eq!(kv.get("k").await.unwrap().unwrap().value, b"v");
    }

    #[tokio::test]
    async fn txn_value_equals_swap() {
        let kv = kv();
        kv.put("ver", b"3".to_vec()).await.unwrap();

        let resp = kv
            .txn(TxnRequest::when(
                vec![Compare::ValueEquals {
                    key: "ver".to_string(),
                    value: b"3".to_vec(),
                }],
                vec![
                    TxnOp::Put {
                        key: "ver".to_string(),
                        value: b"4".to_vec(),
                    },
                    TxnOp::Put {
                        key: "blob/4".to_string(),
                        value: b"payload".to_vec(),
                    },
                ],
            ))
            .await
            .unwrap();
        assert!(resp.succeeded);
        assert_eq!(kv.get("ver").await.unwrap().unwrap().value, b"4");
        assert!(kv.get("blob/4").await.unwrap().is_some());

        // Stale compare loses.
        let resp = kv
            .txn(TxnRequest::when(
                vec![Compare::ValueEquals {
                    key: "ver".to_string(),
                    value: b"3".to_vec(),
                }],
                vec![TxnOp::Put {
                    key: "ver".to_string(),
                    value: b"5".to_vec(),
                }],
            ))
            .await
            .unwrap();
        assert!(!resp.succeeded);
        assert_eq!(kv.get("ver").await.unwrap().unwrap().value, b"4");
    }

    // ── Leases ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_deletes_attached_keys() {
        let kv = kv();
        let grant = kv.lease_grant(5).await.unwrap();
        kv.put_with_lease("leader", b"n1".to_vec(), grant.id)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(kv.get("leader").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_extends_lease() {
        let kv = kv();
        let grant = kv.lease_grant(5).await.unwrap();
        kv.put_with_lease("leader", b"n1".to_vec(), grant.id)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let ttl = kv.lease_keep_alive_once(grant.id).await.unwrap();
        assert_eq!(ttl, 5);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(kv.get("leader").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoke_deletes_attached_keys() {
        let kv = kv();
        let grant = kv.lease_grant(60).await.unwrap();
        kv.put_with_lease("leader", b"n1".to_vec(), grant.id)
            .await
            .unwrap();

        kv.lease_revoke(grant.id).await.unwrap();
        assert!(kv.get("leader").await.unwrap().is_none());
        assert!(matches!(
            kv.lease_keep_alive_once(grant.id).await,
            Err(KvError::LeaseNotFound(_))
        ));
    }

    // ── Watches ────────────────────────────────────────────────────

    #[tokio::test]
    async fn watch_sees_put_and_delete() {
        let kv = kv();
        let mut rx = kv.watch("w", 0).await.unwrap();

        kv.put("w", b"1".to_vec()).await.unwrap();
        kv.delete("w").await.unwrap();

        match rx.recv().await.unwrap() {
            WatchEvent::Put { kv } => assert_eq!(kv.value, b"1"),
            other => panic!("expected put, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            WatchEvent::Delete { .. }
        ));
    }

    #[tokio::test]
    async fn watch_replays_change_past_from_revision() {
        let kv = kv();
        kv.put("w", b"old".to_vec()).await.unwrap();
        let seen = kv.get("w").await.unwrap().unwrap().mod_revision;
        kv.put("w", b"new".to_vec()).await.unwrap();

        // Registration after the change still observes it.
        let mut rx = kv.watch("w", seen).await.unwrap();
        match rx.recv().await.unwrap() {
            WatchEvent::Put { kv } => assert_eq!(kv.value, b"new"),
            other => panic!("expected put, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn watch_ignores_other_keys() {
        let kv = kv();
        let mut rx = kv.watch("w", 0).await.unwrap();

        kv.put("other", b"x".to_vec()).await.unwrap();
        kv.put("w", b"1".to_vec()).await.unwrap();

        match rx.recv().await.unwrap() {
            WatchEvent::Put { kv } => assert_eq!(kv.key, "w"),
            other => panic!("expected put, got {other:?}"),
        }
    }

    // ── Fault injection ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_parks_calls() {
        let kv = kv();
        kv.put("a", b"1".to_vec()).await.unwrap();

        kv.set_stalled(true);
        assert!(
            tokio::time::timeout(Duration::from_secs(30), kv.get("a"))
                .await
                .is_err()
        );

        // Calls issued after un-stalling proceed normally.
        kv.set_stalled(false);
        assert_eq!(kv.get("a").await.unwrap().unwrap().value, b"1");
    }

    #[tokio::test]
    async fn unavailable_fails_every_call() {
        let kv = kv();
        kv.put("a", b"1".to_vec()).await.unwrap();

        kv.set_unavailable(true);
        assert!(matches!(kv.get("a").await, Err(KvError::Unavailable(_))));
        assert!(matches!(
            kv.put("a", b"2".to_vec()).await,
            Err(KvError::Unavailable(_))
        ));

        kv.set_unavailable(false);
        assert_eq!(kv.get("a").await.unwrap().unwrap().value, b"1");
    }
}
