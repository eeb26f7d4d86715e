//! Shard placement policies.
//!
//! Pickers select leader replicas from an immutable topology snapshot.
//! They are pure functions of the snapshot plus picker-local randomness;
//! no topology locking is involved.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use chronogrid_storage::{ShardNode, ShardRole};

use crate::error::{TopologyError, TopologyResult};
use crate::types::TopologySnapshot;

/// Selects `n` leader replicas to receive new tables.
pub trait ShardPicker: Send + Sync {
    fn pick_shards(&self, snapshot: &TopologySnapshot, n: usize) -> TopologyResult<Vec<ShardNode>>;
}

/// Leader replicas of the snapshot, sorted by shard ID for a stable base
/// order.
fn leader_shards(snapshot: &TopologySnapshot) -> Vec<ShardNode> {
    let mut leaders: Vec<ShardNode> = snapshot
        .shard_nodes
        .iter()
        .filter(|sn| sn.role == ShardRole::Leader)
        .cloned()
        .collect();
    leaders.sort_by_key(|sn| sn.shard_id);
    leaders
}

// ── RandomBalanced ────────────────────────────────────────────────

/// Uniform-random balanced placement: shuffle the leader shards and take
/// the first `n`; when `n` exceeds the shard count, continue with
/// additional shuffled passes, so a shard repeats only then.
pub struct RandomBalancedPicker {
    rng: Mutex<StdRng>,
}

impl Default for RandomBalancedPicker {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomBalancedPicker {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic shuffles, for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl ShardPicker for RandomBalancedPicker {
    fn pick_shards(&self, snapshot: &TopologySnapshot, n: usize) -> TopologyResult<Vec<ShardNode>> {
        let leaders = leader_shards(snapshot);
        if leaders.is_empty() {
            return Err(TopologyError::NoEligibleShard {
                node: "<any>".to_string(),
            });
        }

        let mut rng = self.rng.lock().unwrap();
        let mut picked = Vec::with_capacity(n);
        while picked.len() < n {
            let mut pass = leaders.clone();
            pass.shuffle(&mut *rng);
            let remaining = n - picked.len();
            picked.extend(pass.into_iter().take(remaining));
        }
        Ok(picked)
    }
}

// ── LeastTable ────────────────────────────────────────────────────

/// Least-loaded placement: leader shards ordered by current table count
/// ascending, ties broken by shard ID; cycles from the start when `n`
/// exceeds the shard count.
#[derive(Debug, Default)]
pub struct LeastTablePicker;

impl LeastTablePicker {
    pub fn new() -> Self {
        Self
    }
}

impl ShardPicker for LeastTablePicker {
    fn pick_shards(&self, snapshot: &TopologySnapshot, n: usize) -> TopologyResult<Vec<ShardNode>> {
        let mut leaders = leader_shards(snapshot);
        if leaders.is_empty() {
            return Err(TopologyError::NoEligibleShard {
                node: "<any>".to_string(),
            });
        }

        let table_count = |sn: &ShardNode| {
            snapshot
                .shard_views
                .get(&sn.shard_id)
                .map_or(0, |view| view.table_ids.len())
        };
        leaders.sort_by_key(|sn| (table_count(sn), sn.shard_id));

        Ok(leaders.iter().cycle().take(n).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronogrid_storage::{ShardId, ShardView, TableId};
    use std::collections::{HashMap, HashSet};

    /// Snapshot with one leader per shard and the given table loads.
    fn snapshot(tables_per_shard: &[(ShardId, usize)]) -> TopologySnapshot {
        let mut shard_nodes = Vec::new();
        let mut shard_views = HashMap::new();
        for &(shard_id, tables) in tables_per_shard {
            shard_nodes.push(ShardNode {
                shard_id,
                node_name: format!("n{}", shard_id % 2),
                role: ShardRole::Leader,
            });
            shard_nodes.push(ShardNode {
                shard_id,
                node_name: "spare".to_string(),
                role: ShardRole::Follower,
            });
            shard_views.insert(
                shard_id,
                ShardView {
                    shard_id,
                    version: 0,
                    table_ids: (0..tables as TableId)
                        .map(|i| shard_id * 1000 + i)
                        .collect(),
                    created_at_ms: 1000,
                },
            );
        }
        TopologySnapshot {
            shard_nodes,
            shard_views,
        }
    }

    fn distinct_shards(picked: &[ShardNode]) -> HashSet<ShardId> {
        picked.iter().map(|sn| sn.shard_id).collect()
    }

    // ── RandomBalanced ─────────────────────────────────────────────

    #[test]
    fn random_picker_distinct_up_to_shard_count() {
        let snap = snapshot(&[(1, 0), (2, 0), (3, 0), (4, 0)]);
        let picker = RandomBalancedPicker::with_seed(42);

        for n in 1..=4 {
            let picked = picker.pick_shards(&snap, n).unwrap();
            assert_eq!(picked.len(), n);
            assert_eq!(distinct_shards(&picked).len(), n);
        }
    }

    #[test]
    fn random_picker_cycles_beyond_shard_count() {
        let snap = snapshot(&[(1, 0), (2, 0), (3, 0), (4, 0)]);
        let picker = RandomBalancedPicker::with_seed(42);

        for n in [5, 9] {
            let picked = picker.pick_shards(&snap, n).unwrap();
            assert_eq!(picked.len(), n);
            // Only the four known shards ever appear.
            assert!(distinct_shards(&picked).len() <= 4);
        }
    }

    #[test]
    fn random_picker_only_returns_leaders() {
        let snap = snapshot(&[(1, 0), (2, 0)]);
        let picker = RandomBalancedPicker::with_seed(42);

        let picked = picker.pick_shards(&snap, 2).unwrap();
        assert!(picked.iter().all(|sn| sn.role == ShardRole::Leader));
    }

    #[test]
    fn random_picker_empty_snapshot_is_an_error() {
        let picker = RandomBalancedPicker::with_seed(42);
        assert!(matches!(
            picker.pick_shards(&TopologySnapshot::default(), 1),
            Err(TopologyError::NoEligibleShard { .. })
        ));
    }

    // ── LeastTable ─────────────────────────────────────────────────

    #[test]
    fn least_table_distinct_up_to_shard_count() {
        let snap = snapshot(&[(1, 2), (2, 1), (3, 3), (4, 0)]);
        let picker = LeastTablePicker::new();

        let picked = picker.pick_shards(&snap, 4).unwrap();
        assert_eq!(distinct_shards(&picked).len(), 4);
    }

    #[test]
    fn least_table_orders_by_load_then_shard_id() {
        let snap = snapshot(&[(1, 2), (2, 1), (3, 1), (4, 0)]);
        let picker = LeastTablePicker::new();

        let picked = picker.pick_shards(&snap, 4).unwrap();
        let order: Vec<ShardId> = picked.iter().map(|sn| sn.shard_id).collect();
        assert_eq!(order, vec![4, 2, 3, 1]);
    }

    #[test]
    fn least_table_cycles_beyond_shard_count() {
        let snap = snapshot(&[(1, 0), (2, 0), (3, 0), (4, 0)]);
        let picker = LeastTablePicker::new();

        let picked = picker.pick_shards(&snap, 7).unwrap();
        assert_eq!(picked.len(), 7);
        assert_eq!(distinct_shards(&picked).len(), 4);
        // Cycling restarts from the least-loaded shard.
        assert_eq!(picked[4].shard_id, picked[0].shard_id);
    }

    #[test]
    fn least_table_prefers_emptier_shard_after_placement() {
        // Four shards, one table already on shard 0.
        let snap = snapshot(&[(0, 1), (1, 0), (2, 0), (3, 0)]);
        let picker = LeastTablePicker::new();

        let picked = picker.pick_shards(&snap, 3).unwrap();
        let order: Vec<ShardId> = picked.iter().map(|sn| sn.shard_id).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
