//! Leader watcher — drives the election state machine.
//!
//! The invariant enforced here is that the meta-leader is always the
//! same replica as the consensus backend's own leader. Each iteration
//! observes both and acts:
//!
//! | meta-leader | relation | action |
//! |---|---|---|
//! | absent | self is consensus leader | campaign and hold |
//! | absent | self is not | wait ("elect") |
//! | present | equals consensus leader | watch for change |
//! | present | differs, is self | reset own key |
//! | present | differs, not self | wait ("reset") |
//!
//! Errors sleep `WATCH_FAIL_INTERVAL` and retry; mismatches are
//! corrected, never tolerated.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::member::{LeadershipState, Member};

/// Retry interval after a failed observation or correction.
pub const WATCH_FAIL_INTERVAL: Duration = Duration::from_millis(200);

/// What the election needs to know about its surroundings.
pub trait ElectionContext: Send + Sync {
    /// The consensus backend's current leader replica ID.
    fn consensus_leader_id(&self) -> u64;

    /// Whether the server is closing.
    fn should_stop(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitReason {
    None,
    Backend,
    Elect,
    Reset,
}

impl WaitReason {
    fn as_str(self) -> &'static str {
        match self {
            WaitReason::None => "",
            WaitReason::Backend => "backend error",
            WaitReason::Elect => "leader is electing",
            WaitReason::Reset => "leader is reset",
        }
    }
}

/// Drives one member's participation in the election.
pub struct LeaderWatcher {
    member: Arc<Member>,
    ctx: Arc<dyn ElectionContext>,
}

impl LeaderWatcher {
    pub fn new(member: Arc<Member>, ctx: Arc<dyn ElectionContext>) -> Self {
        Self { member, ctx }
    }

    /// Run the election loop until `shutdown` trips or the context asks
    /// to stop.
    pub async fn watch(&self, mut shutdown: watch::Receiver<bool>) {
        let mut wait = WaitReason::None;
        let name = self.member.descriptor().name.clone();

        loop {
            if self.ctx.should_stop() {
                warn!(member = %name, "stop watching leader, server is closing");
                return;
            }
            if *shutdown.borrow() {
                warn!(member = %name, "stop watching leader, shutdown");
                return;
            }

            if wait != WaitReason::None {
                warn!(member = %name, reason = wait.as_str(), "waiting before next check");
                tokio::select! {
                    _ = tokio::time::sleep(WATCH_FAIL_INTERVAL) => {}
                    _ = shutdown.changed() => continue,
                }
                wait = WaitReason::None;
            }

            let leader_resp = match self.member.get_leader().await {
                Ok(resp) => resp,
                Err(err) => {
                    error!(member = %name, error = %err, "failed to get leader");
                    wait = WaitReason::Backend;
                    continue;
                }
            };

            let consensus_leader = self.ctx.consensus_leader_id();
            match leader_resp.leader {
                None => {
                    self.member.publish_leadership(LeadershipState::default());
                    if self.member.id() == consensus_leader {
                        // Campaign and block for the whole tenure.
                        match self.member.campaign_and_keep_leader(&mut shutdown).await {
                            Ok(()) => info!(member = %name, "leadership tenure ended"),
                            Err(err) => {
                                error!(member = %name, error = %err, "campaign failed");
                                wait = WaitReason::Backend;
                            }
                        }
                    } else {
                        // Some other replica must win; check again shortly.
                        wait = WaitReason::Elect;
                    }
                }
                Some(leader) => {
                    if leader.id == consensus_leader {
                        self.member.publish_leadership(LeadershipState {
                            is_self: leader.id == self.member.id(),
                            leader: Some(leader),
                        });
                        // Aligned; block until the key changes.
                        if let Err(err) = self
                            .member
                            .wait_for_leader_change(leader_resp.revision, &mut shutdown)
                            .await
                        {
                            error!(member = %name, error = %err, "leader watch failed");
                            wait = WaitReason::Backend;
                        } else {
                            info!(member = %name, "leader changed, rechecking");
                        }
                    } else if leader.id == self.member.id() {
                        // We hold the key but lost the consensus
                        // leadership; step down.
                        if let Err(err) = self.member.reset_leader().await {
                            error!(member = %name, error = %err, "failed to reset leader");
                            wait = WaitReason::Backend;
                        }
                        self.member.publish_leadership(LeadershipState::default());
                    } else {
                        // The mismatched holder must reset itself first.
                        wait = WaitReason::Reset;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberDescriptor;
    use chronogrid_kv::{KvBackend, MemKv};
    use chronogrid_storage::keys;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    const RPC_TIMEOUT: Duration = Duration::from_secs(3);

    struct TestContext {
        consensus_leader: AtomicU64,
        stop: AtomicBool,
    }

    impl TestContext {
        fn leading(id: u64) -> Arc<Self> {
            Arc::new(Self {
                consensus_leader: AtomicU64::new(id),
                stop: AtomicBool::new(false),
            })
        }
    }

    impl ElectionContext for TestContext {
        fn consensus_leader_id(&self) -> u64 {
            self.consensus_leader.load(Ordering::SeqCst)
        }
        fn should_stop(&self) -> bool {
            self.stop.load(Ordering::SeqCst)
        }
    }

    fn member(id: u64, name: &str, kv: &Arc<MemKv>) -> Arc<Member> {
        Arc::new(Member::new(
            MemberDescriptor {
                id,
                name: name.to_string(),
                endpoint: format!("http://{name}:2379"),
            },
            Arc::clone(kv) as Arc<dyn KvBackend>,
            "/meta",
            RPC_TIMEOUT,
            10,
        ))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn consensus_leader_campaigns_and_wins() {
        let kv = Arc::new(MemKv::new());
        let m1 = member(1, "m1", &kv);
        let ctx = TestContext::leading(1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = LeaderWatcher::new(Arc::clone(&m1), ctx);
        let handle = tokio::spawn(async move { watcher.watch(shutdown_rx).await });

        let leadership = m1.leadership();
        wait_until(|| leadership.borrow().is_self).await;
        assert_eq!(m1.get_leader().await.unwrap().leader.unwrap().name, "m1");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn follower_waits_and_observes_the_winner() {
        let kv = Arc::new(MemKv::new());
        let m1 = member(1, "m1", &kv);
        let m2 = member(2, "m2", &kv);
        // Replica 1 is the consensus leader for both.
        let ctx = TestContext::leading(1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let w1 = LeaderWatcher::new(Arc::clone(&m1), Arc::clone(&ctx) as Arc<dyn ElectionContext>);
        let w2 = LeaderWatcher::new(Arc::clone(&m2), ctx);
        let h1 = tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move { w1.watch(shutdown).await }
        });
        let h2 = tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move { w2.watch(shutdown).await }
        });

        let l1 = m1.leadership();
        let l2 = m2.leadership();
        wait_until(|| l1.borrow().is_self).await;
        wait_until(|| {
            let seen = l2.borrow();
            !seen.is_self && seen.leader.as_ref().is_some_and(|l| l.id == 1)
        })
        .await;

        shutdown_tx.send(true).unwrap();
        h1.await.unwrap();
        h2.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_holder_resets_itself() {
        let kv = Arc::new(MemKv::new());
        let m2 = member(2, "m2", &kv);
        // m2 holds the key, but replica 1 is the consensus leader.
        let value = serde_json::to_vec(m2.descriptor()).unwrap();
        kv.put(&keys::leader_key("/meta"), value).await.unwrap();
        let ctx = TestContext::leading(1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = LeaderWatcher::new(Arc::clone(&m2), ctx);
        let handle = tokio::spawn(async move { watcher.watch(shutdown_rx).await });

        // The key disappears once m2 resets it.
        tokio::time::timeout(Duration::from_secs(60), async {
            let key = keys::leader_key("/meta");
            while kv.get(&key).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("leader key was not reset");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failover_elects_the_new_consensus_leader() {
        let kv = Arc::new(MemKv::new());
        let m1 = member(1, "m1", &kv);
        let m2 = member(2, "m2", &kv);
        let ctx = TestContext::leading(1);

        let (shutdown1_tx, shutdown1_rx) = watch::channel(false);
        let (shutdown2_tx, shutdown2_rx) = watch::channel(false);
        let w1 = LeaderWatcher::new(Arc::clone(&m1), Arc::clone(&ctx) as Arc<dyn ElectionContext>);
        let w2 = LeaderWatcher::new(Arc::clone(&m2), Arc::clone(&ctx) as Arc<dyn ElectionContext>);
        let h1 = tokio::spawn(async move { w1.watch(shutdown1_rx).await });
        let h2 = tokio::spawn(async move { w2.watch(shutdown2_rx).await });

        let l1 = m1.leadership();
        wait_until(|| l1.borrow().is_self).await;

        // Kill the current leader: consensus moves to replica 2 and the
        // old leader's watcher stops renewing.
        ctx.consensus_leader.store(2, Ordering::SeqCst);
        shutdown1_tx.send(true).unwrap();
        h1.await.unwrap();

        // Within lease TTL + rpc timeout the follower campaigns and wins.
        let l2 = m2.leadership();
        wait_until(|| l2.borrow().is_self).await;
        assert_eq!(m2.get_leader().await.unwrap().leader.unwrap().name, "m2");

        shutdown2_tx.send(true).unwrap();
        h2.await.unwrap();
    }
}
