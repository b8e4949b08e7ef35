use std::sync::Arc;
use std::time::Duration;

use turnstile_core::models::{run_mask, MAX_BLOCK_WIDTH};
use turnstile_core::{BlockLabel, InventoryError, InventoryResult, SeatRun};
use turnstile_store::{Batch, BatchOutcome, Store};

/// One seat block: a u32 bitfield where bit `i` is seat `i + 1` and 1 means free.
///
/// Holds no state of its own. Every call goes to the store, which applies
/// each write with no interleaving from other callers.
#[derive(Clone)]
pub struct BitsetBlock {
    store: Arc<dyn Store>,
    key: String,
    width: u32,
}

impl BitsetBlock {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>, width: u32) -> InventoryResult<Self> {
        if width == 0 || width > MAX_BLOCK_WIDTH {
            return Err(InventoryError::InvalidRequest(format!(
                "block width {width} is outside 1..={MAX_BLOCK_WIDTH}"
            )));
        }
        Ok(Self {
            store,
            key: key.into(),
            width,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub async fn get(&self) -> InventoryResult<u32> {
        Ok(self.store.get_bits(&self.key).await?)
    }

    pub async fn set(&self, bits: u32) -> InventoryResult<()> {
        let batch = Batch::new().set_bits(&self.key, bits);
        self.store.execute(&batch).await?;
        Ok(())
    }

    pub async fn free_count(&self) -> InventoryResult<u32> {
        Ok(self.store.bitcount(&self.key).await?)
    }

    /// Write `mask` into a short-lived commit record and XOR it into the block.
    ///
    /// Guarded on every mask bit still being free, so a seat can never be
    /// XORed back to free by a second commit of the same mask.
    pub fn commit_batch(&self, commit_key: &str, mask: u32, ttl: Duration) -> Batch {
        Batch::new()
            .bits_set(&self.key, mask)
            .set_bits(commit_key, mask)
            .expire(commit_key, ttl)
            .xor_bits(&self.key, commit_key)
    }

    /// Returns false if any seat in `mask` was already taken; nothing is written then.
    pub async fn xor_commit(&self, commit_key: &str, mask: u32, ttl: Duration) -> InventoryResult<bool> {
        let batch = self.commit_batch(commit_key, mask, ttl);
        match self.store.execute(&batch).await? {
            BatchOutcome::Applied => Ok(true),
            BatchOutcome::GuardFailed { .. } => Ok(false),
            BatchOutcome::NegativeCounter { key, field } => Err(InventoryError::ConsistencyViolation(
                format!("unexpected counter check on {key}/{field}"),
            )),
        }
    }
}

pub fn is_free(bits: u32, seat: u32) -> bool {
    seat >= 1 && seat <= MAX_BLOCK_WIDTH && bits & (1 << (seat - 1)) != 0
}

/// Every window of `count` consecutive free seats in a block, lowest first.
///
/// A pure view over one read of the block; re-read and rebuild to observe
/// later changes.
#[derive(Debug, Clone)]
pub struct FreeRuns {
    block: BlockLabel,
    bits: u32,
    count: u32,
    last_start: u32,
    next_start: u32,
}

impl FreeRuns {
    pub fn new(block: BlockLabel, bits: u32, width: u32, count: u32) -> Self {
        let width = width.min(MAX_BLOCK_WIDTH);
        // a block with fewer free bits than requested can't hold the run
        let viable = count > 0 && count <= width && (bits & run_mask(1, width)).count_ones() >= count;
        Self {
            block,
            bits,
            count,
            last_start: if viable { width - count + 1 } else { 0 },
            next_start: 1,
        }
    }
}

impl Iterator for FreeRuns {
    type Item = SeatRun;

    fn next(&mut self) -> Option<SeatRun> {
        while self.next_start <= self.last_start {
            let first = self.next_start;
            self.next_start += 1;
            let mask = run_mask(first, self.count);
            if self.bits & mask == mask {
                return Some(SeatRun {
                    block: self.block.clone(),
                    first_seat: first,
                    last_seat: first + self.count - 1,
                });
            }
        }
        None
    }
}

/// Render a block as `O` (free) and `X` (taken), seat 1 first.
pub fn pattern(bits: u32, width: u32) -> String {
    (1..=width.min(MAX_BLOCK_WIDTH))
        .map(|seat| if is_free(bits, seat) { 'O' } else { 'X' })
        .collect()
}
