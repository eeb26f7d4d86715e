//! Block-based monotonic ID allocator.
//!
//! Reserves IDs in blocks of `step` by compare-and-setting a persisted
//! high-water mark, then hands them out from memory. IDs are strictly
//! increasing; blocks lost to a crash leave gaps, which is acceptable.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use chronogrid_kv::{Compare, KvBackend, TxnOp, TxnRequest};

use crate::error::{StorageError, StorageResult};

pub const DEFAULT_ALLOC_STEP: u64 = 20;

#[derive(Debug, Default)]
struct Block {
    /// Next ID to hand out.
    next: u64,
    /// Last ID of the reserved block (inclusive). `next > end` means
    /// the block is exhausted.
    end: u64,
}

/// Allocates monotonically increasing IDs backed by a persisted
/// high-water mark at `key`.
pub struct IdAllocator {
    kv: Arc<dyn KvBackend>,
    key: String,
    step: u64,
    block: Mutex<Block>,
}

impl IdAllocator {
    pub fn new(kv: Arc<dyn KvBackend>, key: impl Into<String>, step: u64) -> Self {
        Self {
            kv,
            key: key.into(),
            step: step.max(1),
            block: Mutex::new(Block { next: 1, end: 0 }),
        }
    }

    /// Allocate the next ID, reserving a fresh block when the current
    /// one is exhausted.
    pub async fn alloc(&self) -> StorageResult<u64> {
        let mut block = self.block.lock().await;
        if block.next > block.end {
            *block = self.reserve_block().await?;
        }
        let id = block.next;
        block.next += 1;
        Ok(id)
    }

    /// Compare-and-set the high-water mark forward by `step`, retrying
    /// when another replica races the reservation.
    async fn reserve_block(&self) -> StorageResult<Block> {
        loop {
            let current = self
                .kv
                .get(&self.key)
                .await
                .map_err(|e| StorageError::backend("read id high-water mark", e))?;

            let (compare, base) = match &current {
                Some(kv) => {
                    let base = std::str::from_utf8(&kv.value)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                        .ok_or_else(|| StorageError::Corrupt {
                            key: self.key.clone(),
                            reason: "invalid high-water mark".to_string(),
                        })?;
                    (
                        Compare::ValueEquals {
                            key: self.key.clone(),
                            value: kv.value.clone(),
                        },
                        base,
                    )
                }
                None => (
                    Compare::KeyMissing {
                        key: self.key.clone(),
                    },
                    0,
                ),
            };

            let new_hwm = base + self.step;
            let resp = self
                .kv
                .txn(TxnRequest::when(
                    vec![compare],
                    vec![TxnOp::Put {
                        key: self.key.clone(),
                        value: new_hwm.to_string().into_bytes(),
                    }],
                ))
                .await
                .map_err(|e| StorageError::backend("advance id high-water mark", e))?;

            if resp.succeeded {
                debug!(key = %self.key, base, new_hwm, "id block reserved");
                return Ok(Block {
                    next: base + 1,
                    end: new_hwm,
                });
            }
            // Lost the race; re-read and try again.
        }
    }
}
